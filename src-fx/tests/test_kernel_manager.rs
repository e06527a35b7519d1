// Integration tests for kernel storage, combination and import

use rtfx::kernel::SpatialSelection;
use rtfx::kernel::wav;
use rtfx::{Kernel, KernelError, KernelManager};
use std::path::Path;
use tempfile::TempDir;

fn manager(dir: &Path) -> KernelManager {
    KernelManager::new(dir.join("irs"), Vec::new())
}

#[test]
fn test_combine_save_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    let a = Kernel::stereo("a", 48000, vec![1.0, 0.5], vec![0.25, 0.5]);
    let b = Kernel::stereo("b", 48000, vec![0.5, 0.0, -0.5], vec![1.0, 1.0, 1.0]);
    manager.save(&a, "a").unwrap();
    manager.save(&b, "b").unwrap();

    let combined = manager.combine("a", "b", "ab").unwrap();
    assert_eq!(combined.len(), 2 + 3 - 1);
    assert_eq!(combined.left, vec![0.5, 0.25, -0.5, -0.25]);
    assert_eq!(combined.right, vec![0.25, 0.75, 0.75, 0.5]);

    let loaded = manager.try_load("ab", &SpatialSelection::default()).unwrap();
    assert_eq!(loaded.left, combined.left);
    assert_eq!(loaded.right, combined.right);
    assert_eq!(loaded.rate, 48000);
    assert!(manager.list().unwrap().contains(&"ab".to_string()));
}

#[test]
fn test_combine_with_true_stereo_writes_four_channels() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    let stereo = Kernel::stereo("s", 48000, vec![1.0], vec![1.0]);
    let cross = Kernel::true_stereo("x", 48000, vec![0.0], vec![1.0], vec![1.0], vec![0.0]);
    manager.save(&stereo, "s").unwrap();
    manager.save(&cross, "x").unwrap();

    let combined = manager.combine("s", "x", "sx").unwrap();
    assert!(combined.is_true_stereo());

    let path = manager.search("sx").unwrap();
    let (channels, frames) = wav::probe(&path).unwrap();
    assert_eq!((channels, frames), (4, 1));

    let loaded = manager.load("sx");
    assert_eq!(loaded.left_to_right, vec![1.0]);
    assert_eq!(loaded.right_to_left, vec![1.0]);
    assert_eq!(loaded.left, vec![0.0]);
}

#[test]
fn test_combine_resamples_to_higher_rate() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    let mut impulse = vec![0.0; 64];
    impulse[0] = 1.0;
    let low = Kernel::stereo("low", 44100, impulse.clone(), impulse.clone());
    let high = Kernel::stereo("high", 48000, impulse.clone(), impulse);
    manager.save(&low, "low").unwrap();
    manager.save(&high, "high").unwrap();

    let combined = manager.combine("low", "high", "mixed").unwrap();
    assert_eq!(combined.rate, 48000);
    assert_eq!(manager.load("mixed").rate, 48000);
}

#[test]
fn test_combine_missing_input_fails() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    manager
        .save(&Kernel::stereo("a", 48000, vec![1.0], vec![1.0]), "a")
        .unwrap();
    assert!(matches!(
        manager.combine("a", "absent", "out"),
        Err(KernelError::NotFound(_))
    ));
    assert!(matches!(
        manager.combine("a", "a", ""),
        Err(KernelError::EmptyName)
    ));
}

#[test]
fn test_import_resolves_name_collisions() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    let source = dir.path().join("room.wav");
    wav::write_channels(&source, 48000, &[&[1.0_f32, 0.5][..], &[0.5_f32, 0.25][..]]).unwrap();

    assert_eq!(manager.import(&source).unwrap(), "room");
    assert_eq!(manager.import(&source).unwrap(), "room (1)");
    assert_eq!(manager.import(&source).unwrap(), "room (2)");
    assert_eq!(manager.list().unwrap(), vec!["room", "room (1)", "room (2)"]);

    let loaded = manager.load("room (1)");
    assert_eq!(loaded.left, vec![1.0, 0.5]);

    manager.remove("room (1)").unwrap();
    assert_eq!(manager.list().unwrap(), vec!["room", "room (2)"]);
}

#[test]
fn test_import_rejects_bad_files() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());

    let three = dir.path().join("three.wav");
    wav::write_channels(&three, 48000, &[&[1.0_f32][..], &[1.0_f32][..], &[1.0_f32][..]]).unwrap();
    assert!(matches!(
        manager.import(&three),
        Err(KernelError::UnsupportedChannels(3))
    ));

    assert!(matches!(
        manager.import(dir.path()),
        Err(KernelError::Invalid(_))
    ));

    let hdf5 = dir.path().join("head.sofa");
    std::fs::write(&hdf5, b"\x89HDF\r\n\x1a\n").unwrap();
    assert!(matches!(manager.import(&hdf5), Err(KernelError::Spatial(_))));
    assert!(manager.list().unwrap().is_empty());
}

#[test]
fn test_import_spatial_dataset_and_select() {
    let dir = TempDir::new().unwrap();
    let manager = manager(dir.path());
    let dataset = serde_json::json!({
        "SamplingRate": 48000.0,
        "SourcePosition": [[0.0, 0.0, 1.0], [90.0, 0.0, 1.0]],
        "Data.IR": [
            [[1.0, 0.0], [0.5, 0.0]],
            [[0.0, 1.0], [0.0, 0.5]]
        ]
    });
    let source = dir.path().join("head.sofa");
    std::fs::write(&source, serde_json::to_vec(&dataset).unwrap()).unwrap();

    assert_eq!(manager.import(&source).unwrap(), "head");
    let side = SpatialSelection {
        azimuth: 80.0,
        elevation: 0.0,
        radius: 1.0,
    };
    let kernel = manager.load_spatial("head", &side);
    assert_eq!(kernel.left, vec![0.0, 1.0]);
    assert_eq!(kernel.spatial.unwrap().measurement_index, Some(1));
}
