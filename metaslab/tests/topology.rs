mod common;

use common::*;
use metaslab::base_types::*;
use metaslab::*;
use std::sync::Arc;

#[test]
fn activation_places_device_after_rotor() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::DynamicFit), 3, 4);
    // Each activation made the new device the rotor.
    assert_eq!(
        h.domain.rotor_order(),
        vec![DeviceId(2), DeviceId(0), DeviceId(1)]
    );
    h.domain.validate().unwrap();

    h.domain.passivate_group(DeviceId(2)).unwrap();
    assert_eq!(h.domain.rotor_order(), vec![DeviceId(0), DeviceId(1)]);
    h.domain.validate().unwrap();

    h.domain.passivate_group(DeviceId(1)).unwrap();
    assert_eq!(h.domain.rotor_order(), vec![DeviceId(0)]);

    h.domain.activate_group(DeviceId(2)).unwrap();
    assert_eq!(h.domain.rotor_order(), vec![DeviceId(2), DeviceId(0)]);
    h.domain.validate().unwrap();
}

#[test]
fn passivated_device_takes_no_allocations() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::DynamicFit), 2, 4);
    h.domain.passivate_group(DeviceId(1)).unwrap();
    for _ in 0..8 {
        assert_eq!(h.alloc(65536, 1, Txg(5)).unwrap()[0].vdev, DeviceId(0));
    }
    let group = h.domain.group(DeviceId(1)).unwrap();
    assert_eq!(group.activation_count(), 0);
}

#[test]
fn unknown_devices_are_unavailable() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::DynamicFit), 1, 4);
    assert!(matches!(
        h.domain.activate_group(DeviceId(3)),
        Err(MetaslabError::DeviceUnavailable(DeviceId(3)))
    ));
    assert!(matches!(
        h.domain.passivate_group(DeviceId(3)),
        Err(MetaslabError::DeviceUnavailable(DeviceId(3)))
    ));
    assert!(matches!(
        h.domain.remove_device(DeviceId(3)),
        Err(MetaslabError::DeviceUnavailable(DeviceId(3)))
    ));
    assert!(h.domain.group(DeviceId(3)).is_none());
}

#[test]
fn device_cannot_be_added_twice() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::DynamicFit), 1, 4);
    let device = DeviceInfo::new(DeviceId(0), 4 << MS_SHIFT, MS_SHIFT);
    assert!(h.domain.add_device(device, &[], TXG_INITIAL).is_err());
    assert_eq!(h.domain.get_space(), 4 * MS_SIZE);
}

#[test]
fn too_many_descriptors_are_rejected() {
    let h = Harness::new(DomainKind::Normal, tunables(StrategyKind::DynamicFit));
    let device = DeviceInfo::new(DeviceId(0), 2 << MS_SHIFT, MS_SHIFT);
    let phys = [ExtentIndexPhys::default(); 3];
    assert!(matches!(
        h.domain.add_device(device, &phys, TXG_INITIAL),
        Err(MetaslabError::CorruptIndexState(_))
    ));
    assert!(h.domain.group(DeviceId(0)).is_none());
}

#[test]
fn active_device_cannot_be_removed() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::DynamicFit), 2, 4);
    assert!(matches!(
        h.domain.remove_device(DeviceId(0)),
        Err(MetaslabError::CorruptIndexState(_))
    ));

    h.domain.passivate_group(DeviceId(0)).unwrap();
    h.domain.remove_device(DeviceId(0)).unwrap();
    assert!(h.domain.group(DeviceId(0)).is_none());
    assert_eq!(h.domain.get_space(), 4 * MS_SIZE);
    assert_eq!(h.domain.rotor_order(), vec![DeviceId(1)]);
    h.domain.validate().unwrap();

    // The freed slot is reused.
    h.add_device(DeviceId(5), 2);
    assert_eq!(h.domain.get_space(), 6 * MS_SIZE);
    h.domain.validate().unwrap();
}

#[test]
fn domain_closes_once_empty() {
    let h = Harness::with_devices(DomainKind::Log, tunables(StrategyKind::FirstFit), 2, 4);
    let dvas = h.alloc(4096, 1, Txg(5)).unwrap();
    h.sync_txg(Txg(5));
    h.domain.free(&dvas, Txg(6), false).unwrap();
    h.sync_txg(Txg(6));

    for id in 0..2 {
        h.domain.passivate_group(DeviceId(id)).unwrap();
        h.domain.remove_device(DeviceId(id)).unwrap();
    }
    assert_eq!(h.domain.get_space(), 0);
    assert_eq!(h.domain.get_dspace(), 0);
    h.domain.close().unwrap();
}

#[test]
fn domain_with_devices_refuses_to_close() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::FirstFit), 1, 4);
    assert!(matches!(
        h.domain.close(),
        Err(MetaslabError::CorruptIndexState(_))
    ));
}

#[test]
fn removing_device_keeps_weights_frozen() {
    let h = Harness::new(DomainKind::Normal, tunables(StrategyKind::FirstFit));
    let mut phys = ExtentIndexPhys::default();
    phys.object = h.store.create().unwrap();
    h.store
        .append(&mut phys, &[SpaceMapEntry::alloc(3 * MS_SIZE, MS_SIZE / 2)])
        .unwrap();
    phys.alloc = MS_SIZE / 2;
    let descriptors = [ExtentIndexPhys::default(), Default::default(), Default::default(), phys];
    let device = DeviceInfo::new(DeviceId(0), 4 << MS_SHIFT, MS_SHIFT);
    h.domain.add_device(device, &descriptors, TXG_INITIAL).unwrap();
    h.domain.activate_group(DeviceId(0)).unwrap();
    h.sync_txg(TXG_INITIAL);

    let ms = h.metaslab(DeviceId(0), 3 * MS_SIZE);
    let before = ms.weight();
    let dva = Dva {
        vdev: DeviceId(0),
        offset: 3 * MS_SIZE,
        asize: 4096,
        gang: false,
        copies: 1,
    };
    h.health.set_removing(DeviceId(0), true);
    h.domain.free(&[dva], Txg(5), false).unwrap();
    h.sync_txg(Txg(5));
    assert_eq!(ms.phys().alloc, MS_SIZE / 2 - 4096);
    assert_eq!(ms.weight(), before);

    // Still dirty while the free is deferred; now it gets re-weighed.
    h.health.set_removing(DeviceId(0), false);
    h.sync_txg(Txg(6));
    assert!(ms.weight() > before);
}

#[test]
fn weights_favor_low_offsets() {
    let h = Harness::with_devices(DomainKind::Normal, tunables(StrategyKind::FirstFit), 1, 8);
    let group = h.domain.group(DeviceId(0)).unwrap();
    let weights = group.weights();
    let ids: Vec<usize> = weights.iter().map(|&(id, _)| id).collect();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
    assert_eq!(weights[0].1.space, 2 * MS_SIZE);
    assert!(weights.iter().all(|(_, w)| !w.is_active()));
    assert!(weights.windows(2).all(|w| w[0].1 > w[1].1));
}

#[test]
fn concurrent_allocations_do_not_collide() {
    let h = Arc::new(Harness::with_devices(
        DomainKind::Normal,
        tunables(StrategyKind::DynamicFit),
        3,
        8,
    ));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let h = h.clone();
            std::thread::spawn(move || {
                (0..64)
                    .map(|_| h.alloc(8192, 1, Txg(5)).unwrap()[0])
                    .collect::<Vec<Dva>>()
            })
        })
        .collect();
    let mut all: Vec<Dva> = threads
        .into_iter()
        .flat_map(|t| t.join().unwrap())
        .collect();
    all.sort_by_key(|dva| (dva.vdev, dva.offset));
    for pair in all.windows(2) {
        assert!(!overlaps(&pair[0], &pair[1]), "{} {}", pair[0], pair[1]);
    }
    h.sync_txg(Txg(5));
    assert_eq!(h.domain.get_alloc(), 4 * 64 * 8192);
}
