use metaslab::*;
use std::fs;

// Tunables latch on first use, so this binary holds a single test that
// loads the config before anything reads them.
#[test]
fn group_tunables_are_read_from_config() {
    let path = std::env::temp_dir().join(format!("metaslab-tunables-{}.toml", std::process::id()));
    fs::write(
        &path,
        "zfs_mg_bias_factor = 40\n\
         zfs_mg_stronger_bias = false\n\
         zfs_mg_skip_threshold = 35\n\
         zfs_mg_skip_ratio = 2048\n\
         metaslab_unload_delay = 3\n",
    )
    .unwrap();
    util::read_tunable_config(path.to_str().unwrap()).unwrap();
    fs::remove_file(&path).unwrap();

    let t = Tunables::default();
    assert_eq!(t.bias_factor, 40);
    assert!(!t.stronger_bias);
    assert_eq!(t.skip_threshold, 35);
    assert_eq!(t.skip_ratio, 2048);
    assert_eq!(t.unload_delay, 3);
    assert_eq!(t.aliquot, 512 << 10);
}
