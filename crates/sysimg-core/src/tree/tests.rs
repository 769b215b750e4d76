use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysimg_schema::{ImageKey, ImageType, VersionDetail};
use tempfile::TempDir;

use super::*;
use crate::keys::KeyRole;
use crate::keys::tests::test_keys;
use crate::tarball::{self, CHANNEL_INI_PATH, VersionTarball};

pub(crate) struct Fixture {
    pub(crate) tmp: TempDir,
    pub(crate) tree: Tree,
}

pub(crate) fn endpoint() -> ServiceEndpoint {
    ServiceEndpoint {
        base: "si.example.com".into(),
        http_port: 80,
        https_port: 443,
    }
}

pub(crate) fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let keys = test_keys(&tmp.path().join("keys"));
    let tree = Tree::open(&tmp.path().join("www"), Arc::new(keys), endpoint()).unwrap();
    Fixture { tmp, tree }
}

/// Write and sign a file at `rel` under the publish root.
pub(crate) fn publish_file(tree: &Tree, rel: &str, content: &[u8]) -> PathBuf {
    let path = tree.root().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    let sig = signature_path(&path);
    let _ = std::fs::remove_file(&sig);
    tree.keys().sign_file(None, &path).unwrap();
    path
}

fn mako(f: &Fixture) -> Device {
    f.tree.create_channel("stable").unwrap();
    f.tree.create_device("stable", "mako", None).unwrap()
}

fn versions(device: &Device, kind: ImageType) -> Vec<u64> {
    let mut v: Vec<u64> = device
        .list_images()
        .unwrap()
        .iter()
        .filter(|i| i.kind == kind)
        .map(|i| i.version)
        .collect();
    v.sort_unstable();
    v
}

#[test]
fn test_open_creates_signed_channels() {
    let f = fixture();
    assert!(f.tree.channels_path().exists());
    f.tree.keys().verify_file(&f.tree.channels_path()).unwrap();
    assert_eq!(f.tree.list_channels().unwrap(), ChannelsFile::new());
}

#[test]
fn test_create_channel_and_device() {
    let f = fixture();
    let device = mako(&f);

    let channels = f.tree.list_channels().unwrap();
    let entry = channels.device("stable", "mako").unwrap();
    assert_eq!(entry.index.as_deref(), Some("/stable/mako/index.json"));
    assert!(device.index_path().exists());
    f.tree.keys().verify_file(&device.index_path()).unwrap();
    assert!(device.list_images().unwrap().is_empty());

    assert!(matches!(
        f.tree.create_channel("stable"),
        Err(TreeError::ChannelExists(_))
    ));
    assert!(matches!(
        f.tree.create_device("stable", "mako", None),
        Err(TreeError::DeviceExists { .. })
    ));
    assert!(matches!(
        f.tree.create_device("nope", "mako", None),
        Err(TreeError::MissingChannel(_))
    ));
    assert!(matches!(
        f.tree.get_device("stable", "flo"),
        Err(TreeError::MissingDevice { .. })
    ));
}

#[test]
fn test_create_image_records_files() {
    let f = fixture();
    let device = mako(&f);
    let file = publish_file(&f.tree, "pool/a-1.tar.xz", b"hello world");

    let entry = device
        .create_image(
            &NewImage::full(100, vec![file])
                .with_version_detail(VersionDetail::parse("a=1"))
                .with_description("first"),
        )
        .unwrap();
    assert_eq!(entry.files[0].path, "/pool/a-1.tar.xz");
    assert_eq!(entry.files[0].signature, "/pool/a-1.tar.xz.asc");
    assert_eq!(entry.files[0].size, 11);
    assert_eq!(
        entry.files[0].checksum.as_str(),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );

    let index = device.index().unwrap();
    assert_eq!(index.images.len(), 1);
    assert!(index.global.generated_at.is_some());
    f.tree.keys().verify_file(&device.index_path()).unwrap();
}

#[test]
fn test_create_image_validation() {
    let f = fixture();
    let device = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    let a2 = publish_file(&f.tree, "pool/a-2.tar.xz", b"2");

    assert!(matches!(
        device.create_image(&NewImage::full(1, vec![])),
        Err(TreeError::InvalidImage(_))
    ));
    assert!(matches!(
        device.create_image(&NewImage::delta(1, 2, vec![a2.clone()])),
        Err(TreeError::MissingBase { base: 1 })
    ));

    device.create_image(&NewImage::full(2, vec![a1.clone()])).unwrap();
    assert!(matches!(
        device.create_image(&NewImage::full(2, vec![a1.clone()])),
        Err(TreeError::DuplicateImage(_))
    ));
    assert!(matches!(
        device.create_image(&NewImage::full(1, vec![a1])),
        Err(TreeError::VersionNotIncreasing {
            version: 1,
            latest: 2
        })
    ));

    device.create_image(&NewImage::full(3, vec![a2.clone()])).unwrap();
    device.create_image(&NewImage::delta(2, 3, vec![a2])).unwrap();
    assert_eq!(versions(&device, ImageType::Delta), vec![3]);
}

#[test]
fn test_create_image_requires_signatures() {
    let f = fixture();
    let device = mako(&f);
    let unsigned = f.tree.root().join("pool/raw.bin");
    std::fs::create_dir_all(unsigned.parent().unwrap()).unwrap();
    std::fs::write(&unsigned, b"x").unwrap();

    let before = std::fs::read(device.index_path()).unwrap();
    assert!(matches!(
        device.create_image(&NewImage::full(1, vec![unsigned])),
        Err(TreeError::MissingFile(_))
    ));
    assert_eq!(std::fs::read(device.index_path()).unwrap(), before);
}

#[test]
fn test_create_image_rejects_files_outside_root() {
    let f = fixture();
    let device = mako(&f);
    let outside = f.tmp.path().join("outside.bin");
    std::fs::write(&outside, b"x").unwrap();
    f.tree.keys().sign_file(None, &outside).unwrap();
    assert!(matches!(
        device.create_image(&NewImage::full(1, vec![outside])),
        Err(TreeError::OutsideRoot(_))
    ));
}

/// Ten full images, each with a delta from its predecessor.
fn ten_images(f: &Fixture, device: &Device) {
    for v in 1..=10u64 {
        let file = publish_file(&f.tree, &format!("pool/a-{v}.tar.xz"), v.to_string().as_bytes());
        device.create_image(&NewImage::full(v, vec![file.clone()])).unwrap();
        if v > 1 {
            device
                .create_image(&NewImage::delta(v - 1, v, vec![file]))
                .unwrap();
        }
    }
}

#[test]
fn test_expire_images_keeps_newest() {
    let f = fixture();
    let device = mako(&f);
    ten_images(&f, &device);

    let report = f.tree.expire_images("stable", "mako", 6).unwrap();
    assert_eq!(versions(&device, ImageType::Full), vec![5, 6, 7, 8, 9, 10]);
    // Delta 5->6 stays, delta 4->5 goes with its base.
    assert_eq!(versions(&device, ImageType::Delta), vec![6, 7, 8, 9, 10]);
    assert!(report.removed.contains(&ImageKey::full(1)));
    assert!(report.removed.contains(&ImageKey::delta(4, 5)));
    assert!(!f.tree.root().join("pool/a-1.tar.xz").exists());
    assert!(!f.tree.root().join("pool/a-1.tar.xz.asc").exists());
    assert!(f.tree.root().join("pool/a-5.tar.xz").exists());

    f.tree.expire_images("stable", "mako", 3).unwrap();
    assert_eq!(versions(&device, ImageType::Full), vec![8, 9, 10]);
    f.tree.expire_images("stable", "mako", 1).unwrap();
    assert_eq!(versions(&device, ImageType::Full), vec![10]);
    assert!(versions(&device, ImageType::Delta).is_empty());
    f.tree.expire_images("stable", "mako", 0).unwrap();
    assert!(device.list_images().unwrap().is_empty());
}

#[test]
fn test_expire_keeps_files_shared_with_other_devices() {
    let f = fixture();
    let device = mako(&f);
    let other = f.tree.create_device("stable", "flo", None).unwrap();
    let shared = publish_file(&f.tree, "pool/shared.tar.xz", b"shared");
    let newer = publish_file(&f.tree, "pool/new.tar.xz", b"new");

    device.create_image(&NewImage::full(1, vec![shared.clone()])).unwrap();
    device.create_image(&NewImage::full(2, vec![newer])).unwrap();
    other.create_image(&NewImage::full(1, vec![shared.clone()])).unwrap();

    let report = f.tree.expire_images("stable", "mako", 1).unwrap();
    assert_eq!(report.removed, vec![ImageKey::full(1)]);
    assert!(report.deleted_files.is_empty());
    assert!(shared.exists());
}

#[test]
fn test_phased_percentage() {
    let f = fixture();
    let device = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    let a2 = publish_file(&f.tree, "pool/a-2.tar.xz", b"2");
    device.create_image(&NewImage::full(1, vec![a1])).unwrap();
    device.create_image(&NewImage::full(2, vec![a2])).unwrap();

    assert_eq!(device.get_phased_percentage(2).unwrap(), 100);
    device.set_phased_percentage(2, 20).unwrap();
    assert_eq!(device.get_phased_percentage(2).unwrap(), 20);
    assert!(matches!(
        device.set_phased_percentage(1, 20),
        Err(TreeError::NotLatest(1))
    ));
    assert!(matches!(
        device.set_phased_percentage(2, 101),
        Err(TreeError::InvalidPercentage(101))
    ));
    device.set_phased_percentage(2, 100).unwrap();
    assert_eq!(device.index().unwrap().images[1].phased_percentage, None);
}

#[test]
fn test_alias_regenerates_version_tarball() {
    let f = fixture();
    let device = mako(&f);
    let version = f.tree.root().join("stable/mako").join(tarball::version_tarball_name(1));
    VersionTarball {
        channel: "stable",
        device: "mako",
        version: 1,
        channel_target: None,
        version_detail: None,
    }
    .write(&endpoint(), &version)
    .unwrap();
    f.tree.keys().sign_file(Some("mako"), &version).unwrap();
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    device
        .create_image(&NewImage::full(1, vec![a1, version]))
        .unwrap();

    f.tree.create_channel_alias("stable-alias", "stable").unwrap();
    let alias = f.tree.get_device("stable-alias", "mako").unwrap();
    let images = alias.list_images().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].files[0].path, "/pool/a-1.tar.xz");
    assert_eq!(images[0].files[1].path, "/stable-alias/mako/version-1.tar.zst");

    let regenerated = f.tree.abs_path(&images[0].files[1].path);
    let ini = tarball::read_entry(&regenerated, CHANNEL_INI_PATH).unwrap().unwrap();
    assert!(ini.contains("channel: stable-alias\n"));
    assert!(ini.contains("channel_target: stable\n"));
    f.tree.keys().verify_file(&regenerated).unwrap();

    // New images flow through on the next sync.
    let a2 = publish_file(&f.tree, "pool/a-2.tar.xz", b"2");
    device.create_image(&NewImage::full(2, vec![a2])).unwrap();
    f.tree.sync_aliases("stable").unwrap();
    assert_eq!(versions(&alias, ImageType::Full), vec![1, 2]);

    assert!(matches!(
        f.tree.sync_alias("stable"),
        Err(TreeError::NotAnAlias(_))
    ));
}

#[test]
fn test_per_device_redirect() {
    let f = fixture();
    mako(&f);
    f.tree.create_channel("devel").unwrap();
    let target = f.tree.create_device("devel", "mako", None).unwrap();
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    target.create_image(&NewImage::full(7, vec![a1])).unwrap();

    f.tree.create_channel("rc").unwrap();
    f.tree.create_per_device_redirect("mako", "rc", "devel").unwrap();

    let channels = f.tree.list_channels().unwrap();
    let entry = channels.device("rc", "mako").unwrap();
    assert_eq!(entry.redirect.as_deref(), Some("devel"));
    assert_eq!(entry.index.as_deref(), Some("/devel/mako/index.json"));
    assert!(channels.generation_targets("rc").is_empty());

    let via_redirect = f.tree.get_device("rc", "mako").unwrap();
    assert_eq!(via_redirect.channel(), "devel");
    assert_eq!(versions(&via_redirect, ImageType::Full), vec![7]);

    // Dropping the target device removes the dangling redirect on sync.
    f.tree.remove_device("devel", "mako").unwrap();
    f.tree.sync_aliases("devel").unwrap();
    assert!(f.tree.list_channels().unwrap().device("rc", "mako").is_none());
}

#[test]
fn test_channel_redirect_follows_target_devices() {
    let f = fixture();
    mako(&f);
    f.tree.create_channel_redirect("old", "stable").unwrap();
    f.tree.create_device("stable", "flo", None).unwrap();
    f.tree.sync_redirects("stable").unwrap();

    let channels = f.tree.list_channels().unwrap();
    let old = channels.get("old").unwrap();
    assert!(old.devices.contains_key("flo"));
    assert_eq!(channels.resolve("old", "flo").unwrap().channel, "stable");
}

#[test]
fn test_hide_show_and_remove_channel() {
    let f = fixture();
    mako(&f);
    f.tree.hide_channel("stable").unwrap();
    assert!(f.tree.list_channels().unwrap().get("stable").unwrap().hidden);
    f.tree.show_channel("stable").unwrap();
    assert!(!f.tree.list_channels().unwrap().get("stable").unwrap().hidden);

    f.tree.remove_channel("stable").unwrap();
    assert!(!f.tree.root().join("stable").exists());
    assert!(matches!(
        f.tree.remove_channel("stable"),
        Err(TreeError::MissingChannel(_))
    ));
}

#[test]
fn test_device_keyring() {
    let f = fixture();
    mako(&f);
    let keyring = publish_file(&f.tree, "gpg/device-mako.tar.zst", b"keyring");
    f.tree.set_device_keyring("stable", "mako", &keyring).unwrap();
    let channels = f.tree.list_channels().unwrap();
    let entry = channels.device("stable", "mako").unwrap();
    assert_eq!(
        entry.keyring.as_ref().unwrap().path,
        "/gpg/device-mako.tar.zst"
    );
    assert!(matches!(
        f.tree.set_device_keyring("stable", "mako", Path::new("/nonexistent")),
        Err(TreeError::MissingFile(_))
    ));
}

#[test]
fn test_cleanup_tree_removes_only_orphans() {
    let f = fixture();
    let device = mako(&f);
    let live = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    let sidecar = publish_file(&f.tree, "pool/a-1.json", b"{}");
    let orphan = publish_file(&f.tree, "pool/old/b-1.tar.xz", b"old");
    let gpg = publish_file(&f.tree, "gpg/archive-master.tar.zst", b"k");
    device.create_image(&NewImage::full(1, vec![live.clone()])).unwrap();

    let orphans = f.tree.list_orphaned_files().unwrap();
    assert!(orphans.contains(&orphan));
    assert!(orphans.contains(&signature_path(&orphan)));
    assert_eq!(orphans.len(), 2);

    let report = f.tree.cleanup_tree().unwrap();
    assert_eq!(report.removed_files.len(), 2);
    assert!(report.removed_dirs.contains(&f.tree.root().join("pool/old")));
    assert!(live.exists() && sidecar.exists() && gpg.exists());
    assert!(f.tree.channels_path().exists());
    assert!(device.index_path().exists());
    assert!(f.tree.list_orphaned_files().unwrap().is_empty());
}

#[test]
fn test_list_missing_files() {
    let f = fixture();
    let device = mako(&f);
    let file = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    device.create_image(&NewImage::full(1, vec![file.clone()])).unwrap();
    assert!(f.tree.list_missing_files().unwrap().is_empty());

    std::fs::remove_file(&file).unwrap();
    assert_eq!(f.tree.list_missing_files().unwrap(), vec![file]);
}

#[test]
fn test_url_path() {
    let root = Path::new("/srv/www");
    assert_eq!(
        url_path(root, Path::new("/srv/www/pool/./a.tar.xz")).unwrap(),
        "/pool/a.tar.xz"
    );
    assert!(matches!(
        url_path(root, Path::new("/srv/www/../etc/passwd")),
        Err(TreeError::OutsideRoot(_))
    ));
}

#[test]
fn test_create_images_is_all_or_nothing() {
    let f = fixture();
    let device = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    let a2 = publish_file(&f.tree, "pool/a-2.tar.xz", b"2");
    device.create_image(&NewImage::full(1, vec![a1])).unwrap();

    // The delta names a base that was never published.
    let err = device
        .create_images(&[
            NewImage::full(2, vec![a2.clone()]),
            NewImage::delta(1, 2, vec![a2.clone()]),
            NewImage::delta(5, 2, vec![a2.clone()]),
        ])
        .unwrap_err();
    assert!(matches!(err, TreeError::MissingBase { base: 5 }));
    assert_eq!(versions(&device, ImageType::Full), vec![1]);

    let entries = device
        .create_images(&[
            NewImage::full(2, vec![a2.clone()]),
            NewImage::delta(1, 2, vec![a2]),
        ])
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(versions(&device, ImageType::Full), vec![1, 2]);
    assert_eq!(versions(&device, ImageType::Delta), vec![2]);
}

#[test]
fn test_rename_channel() {
    let f = fixture();
    let device = mako(&f);
    let version = f.tree.root().join("stable/mako/version-1.tar.zst");
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    std::fs::write(&version, b"version").unwrap();
    f.tree.keys().sign_file(Some("mako"), &version).unwrap();
    device
        .create_image(&NewImage::full(1, vec![a1, version]))
        .unwrap();
    f.tree.create_channel("rc").unwrap();
    f.tree.create_per_device_redirect("mako", "rc", "stable").unwrap();

    f.tree.rename_channel("stable", "ubuntu-stable").unwrap();

    let channels = f.tree.list_channels().unwrap();
    assert!(!channels.contains("stable"));
    assert!(!f.tree.root().join("stable").exists());
    assert_eq!(
        channels.device("ubuntu-stable", "mako").unwrap().index.as_deref(),
        Some("/ubuntu-stable/mako/index.json")
    );
    let redirect = channels.device("rc", "mako").unwrap();
    assert_eq!(redirect.redirect.as_deref(), Some("ubuntu-stable"));
    assert_eq!(redirect.index.as_deref(), Some("/ubuntu-stable/mako/index.json"));

    let renamed = f.tree.get_device("ubuntu-stable", "mako").unwrap();
    let images = renamed.list_images().unwrap();
    assert_eq!(images[0].files[0].path, "/pool/a-1.tar.xz");
    assert_eq!(images[0].files[1].path, "/ubuntu-stable/mako/version-1.tar.zst");
    assert_eq!(
        images[0].files[1].signature,
        "/ubuntu-stable/mako/version-1.tar.zst.asc"
    );
    f.tree.keys().verify_file(&renamed.index_path()).unwrap();
    assert!(f.tree.list_missing_files().unwrap().is_empty());

    assert!(matches!(
        f.tree.rename_channel("stable", "other"),
        Err(TreeError::MissingChannel(_))
    ));
    assert!(matches!(
        f.tree.rename_channel("ubuntu-stable", "rc"),
        Err(TreeError::ChannelExists(_))
    ));
}

#[test]
fn test_change_channel_alias() {
    let f = fixture();
    let stable = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    stable.create_image(&NewImage::full(1, vec![a1])).unwrap();
    f.tree.create_channel("devel").unwrap();
    let devel = f.tree.create_device("devel", "mako", None).unwrap();
    let a9 = publish_file(&f.tree, "pool/a-9.tar.xz", b"9");
    devel.create_image(&NewImage::full(9, vec![a9])).unwrap();

    f.tree.create_channel_alias("current", "stable").unwrap();
    let current = f.tree.get_device("current", "mako").unwrap();
    assert_eq!(versions(&current, ImageType::Full), vec![1]);

    f.tree.change_channel_alias("current", "devel").unwrap();
    let channels = f.tree.list_channels().unwrap();
    assert_eq!(channels.get("current").unwrap().alias.as_deref(), Some("devel"));
    assert_eq!(versions(&current, ImageType::Full), vec![9]);

    assert!(matches!(
        f.tree.change_channel_alias("stable", "devel"),
        Err(TreeError::NotAnAlias(_))
    ));
    assert!(matches!(
        f.tree.change_channel_alias("current", "missing"),
        Err(TreeError::MissingChannel(_))
    ));
}

#[test]
fn test_set_description() {
    let f = fixture();
    let device = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    device.create_image(&NewImage::full(1, vec![a1])).unwrap();

    device.set_description(&ImageKey::full(1), "Security fixes").unwrap();
    assert_eq!(
        device.get_image(&ImageKey::full(1)).unwrap().unwrap().description,
        "Security fixes"
    );
    assert!(matches!(
        device.set_description(&ImageKey::full(2), "nope"),
        Err(TreeError::MissingImage(_))
    ));
}

#[test]
fn test_set_tag() {
    let f = fixture();
    let device = mako(&f);
    let a1 = publish_file(&f.tree, "pool/a-1.tar.xz", b"1");
    let a2 = publish_file(&f.tree, "pool/a-2.tar.xz", b"2");
    device.create_image(&NewImage::full(1, vec![a1])).unwrap();
    device
        .create_images(&[
            NewImage::full(2, vec![a2.clone()])
                .with_version_detail(VersionDetail::parse("a=2,tag=OTA-1")),
            NewImage::delta(1, 2, vec![a2]).with_version_detail(VersionDetail::parse("a=2")),
        ])
        .unwrap();

    device.set_tag(2, "OTA-2").unwrap();
    for img in device.list_images().unwrap().iter().filter(|i| i.version == 2) {
        assert_eq!(img.version_detail.tag(), Some("OTA-2"));
        assert_eq!(img.version_detail.get("a"), Some("2"));
    }
    assert_eq!(device.get_tag(2).unwrap().as_deref(), Some("OTA-2"));
    assert_eq!(device.get_tag(1).unwrap(), None);

    device.set_tag(2, "").unwrap();
    assert_eq!(device.get_tag(2).unwrap(), None);

    assert!(matches!(device.set_tag(2, "a,b"), Err(TreeError::InvalidTag(_))));
    assert!(matches!(device.set_tag(3, "OTA-3"), Err(TreeError::MissingImage(_))));
}

#[test]
fn test_publish_keyring() {
    let f = fixture();
    let path = f.tree.publish_keyring(KeyRole::ImageSigning).unwrap();
    assert_eq!(path, f.tree.root().join("gpg/image-signing.tar.zst"));
    let signer = f.tree.keys().verify_file(&path).unwrap();
    assert_eq!(signer.meta.role, KeyRole::ImageMaster);

    let json = tarball::read_entry(&path, "keyring.json").unwrap().unwrap();
    assert!(json.contains("image-signing"));

    // Unchanged keyrings keep their signature.
    let sig = std::fs::read(signature_path(&path)).unwrap();
    f.tree.publish_keyring(KeyRole::ImageSigning).unwrap();
    assert_eq!(std::fs::read(signature_path(&path)).unwrap(), sig);

    let master = f.tree.publish_keyring(KeyRole::ArchiveMaster).unwrap();
    assert_eq!(
        f.tree.keys().verify_file(&master).unwrap().meta.role,
        KeyRole::ArchiveMaster
    );
    assert!(f.tree.list_orphaned_files().unwrap().is_empty());
}

#[test]
fn test_publish_device_keyring() {
    let tmp = TempDir::new().unwrap();
    let key_dir = tmp.path().join("keys");
    let policy = crate::config::KeyPolicy::default();
    KeyHierarchy::bootstrap(&key_dir, &policy, "test@example.com", "[TEST]").unwrap();
    KeyHierarchy::create_device_key(&key_dir, &policy, "mako", "test@example.com", "[TEST]")
        .unwrap();
    let keys = KeyHierarchy::open(&key_dir).unwrap();
    let tree = Tree::open(&tmp.path().join("www"), Arc::new(keys), endpoint()).unwrap();
    tree.create_channel("stable").unwrap();
    tree.create_device("stable", "mako", None).unwrap();
    tree.create_device("stable", "flo", None).unwrap();

    let path = tree.publish_device_keyring("stable", "mako").unwrap();
    assert_eq!(path, tree.root().join("stable/mako").join(DEVICE_KEYRING));
    assert_eq!(
        tree.keys().verify_file(&path).unwrap().meta.role,
        KeyRole::ImageSigning
    );
    let channels = tree.list_channels().unwrap();
    let keyring = channels.device("stable", "mako").unwrap().keyring.clone().unwrap();
    assert_eq!(keyring.path, "/stable/mako/device.tar.zst");
    assert_eq!(keyring.signature, "/stable/mako/device.tar.zst.asc");
    assert!(tree.list_orphaned_files().unwrap().is_empty());

    assert!(matches!(
        tree.publish_device_keyring("stable", "flo"),
        Err(TreeError::Key(KeyError::MissingKey(_)))
    ));
}
