use std::collections::HashSet;
use std::io::Write;

use plugin_mirror::test_support::entry_for;
use plugin_mirror::{
    ArtifactKey, ArtifactLookup, FetchedArtifact, LocalCatalog, LocalCatalogEntry, MirrorStore,
    ProductVersion, StoreError, StoredArtifact, checksum_of,
};
use plugin_mirror_store::FsMirrorStore;
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    store: FsMirrorStore,
}

fn create_store() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let store = FsMirrorStore::open(
        root.path().join("catalogs"),
        root.path().join("plugins"),
        "https://mirror.test/plugins",
    )
    .unwrap();
    Fixture { _root: root, store }
}

fn stage(store: &FsMirrorStore, id: &str, version: &str, payload: &[u8]) -> FetchedArtifact {
    let mut file = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(store.staging_dir())
        .unwrap();
    file.write_all(payload).unwrap();
    FetchedArtifact {
        key: ArtifactKey::new(id, version),
        staged: file.into_temp_path(),
        file_name: format!("{id}-{version}.zip"),
        checksum: checksum_of(payload),
        size: payload.len() as u64,
    }
}

fn commit(store: &FsMirrorStore, id: &str, version: &str, payload: &[u8]) -> StoredArtifact {
    store.commit_artifact(stage(store, id, version, payload)).unwrap()
}

fn local_catalog(version: &str, items: &[(&str, &str, &str, &StoredArtifact)]) -> LocalCatalog {
    LocalCatalog {
        version: ProductVersion::new(version),
        entries: items
            .iter()
            .map(|(id, v, payload, artifact)| LocalCatalogEntry {
                entry: entry_for(id, v, payload.as_bytes()),
                artifact: (*artifact).clone(),
            })
            .collect(),
    }
}

#[test]
fn lookup_returns_none_for_unknown_key() {
    let fx = create_store();
    assert_eq!(fx.store.lookup(&ArtifactKey::new("foo", "1.0")).unwrap(), None);
}

#[test]
fn commit_moves_file_and_records_it() {
    let fx = create_store();
    let stored = commit(&fx.store, "foo", "1.0", b"foo-bytes");

    assert_eq!(stored.checksum, checksum_of(b"foo-bytes"));
    assert_eq!(stored.size, 9);
    assert!(stored.relative_path.ends_with("/foo-1.0.zip"));

    let on_disk = plugin_mirror::artifact::absolute_path(fx.store.storage_path(), &stored);
    assert_eq!(std::fs::read(on_disk).unwrap(), b"foo-bytes");

    let found = fx.store.lookup(&stored.key).unwrap().unwrap();
    assert_eq!(found, stored);
    assert!(
        fx.store
            .has_artifact(&stored.key, Some(&checksum_of(b"foo-bytes")))
            .unwrap()
    );

    let staged: Vec<_> = std::fs::read_dir(fx.store.staging_dir()).unwrap().collect();
    assert!(staged.is_empty(), "staging should be empty after commit");
}

#[test]
fn lookup_ignores_truncated_file() {
    let fx = create_store();
    let stored = commit(&fx.store, "foo", "1.0", b"foo-bytes");
    let path = plugin_mirror::artifact::absolute_path(fx.store.storage_path(), &stored);
    std::fs::write(&path, b"foo").unwrap();

    assert_eq!(fx.store.lookup(&stored.key).unwrap(), None);
}

#[test]
fn lookup_ignores_deleted_file() {
    let fx = create_store();
    let stored = commit(&fx.store, "foo", "1.0", b"foo-bytes");
    let path = plugin_mirror::artifact::absolute_path(fx.store.storage_path(), &stored);
    std::fs::remove_file(&path).unwrap();

    assert_eq!(fx.store.lookup(&stored.key).unwrap(), None);
}

#[test]
fn recommit_replaces_record() {
    let fx = create_store();
    commit(&fx.store, "foo", "1.0", b"old");
    let newer = commit(&fx.store, "foo", "1.0", b"newer");

    let found = fx.store.lookup(&newer.key).unwrap().unwrap();
    assert_eq!(found.checksum, checksum_of(b"newer"));
    assert_eq!(fx.store.stored_artifacts().unwrap().len(), 1);
}

#[test]
fn failed_rename_rolls_back_index() {
    let fx = create_store();
    let fetched = stage(&fx.store, "foo", "1.0", b"foo-bytes");
    let key = fetched.key.clone();

    // A directory where the artifact file should go makes the rename fail.
    let dir = plugin_mirror_store::layout::artifact_dir(&key);
    let blocker = plugin_mirror_store::layout::resolve(fx.store.storage_path(), &dir)
        .join("foo-1.0.zip")
        .join("occupied");
    std::fs::create_dir_all(&blocker).unwrap();

    let err = fx.store.commit_artifact(fetched).unwrap_err();
    assert!(matches!(err, StoreError::Persist { .. }));
    assert!(fx.store.stored_artifacts().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(fx.store.staging_dir()).unwrap().count(), 0);
}

#[test]
fn publish_writes_catalog_and_records_entries() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");
    let bar = commit(&fx.store, "bar", "2.0", b"bar");

    let catalog = local_catalog(
        "IC-203.7717",
        &[("foo", "1.0", "foo", &foo), ("bar", "2.0", "bar", &bar)],
    );
    let published = fx.store.publish_catalog(&catalog).unwrap();

    assert_eq!(published.entries, 2);
    assert!(published.path.ends_with("plugins-IC-203.xml"));
    let xml = std::fs::read_to_string(&published.path).unwrap();
    assert!(xml.contains(&format!(
        "url=\"https://mirror.test/plugins/{}\"",
        foo.relative_path
    )));

    let version = ProductVersion::new("IC-203.7717");
    assert_eq!(fx.store.published_versions().unwrap(), vec![version.clone()]);
    assert_eq!(
        fx.store.published_keys(&version).unwrap(),
        HashSet::from([foo.key.clone(), bar.key.clone()])
    );

    let leftovers: Vec<_> = std::fs::read_dir(fx.store.base_path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
        .collect();
    assert!(leftovers.is_empty(), "temporary catalog files must not remain");
}

#[test]
fn first_publish_into_new_store_records_catalog() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");

    fx.store
        .publish_catalog(&local_catalog("IU-211.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();

    let records = fx.store.published_catalogs().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, ProductVersion::new("IU-211.1"));
    assert_eq!(records[0].file_name, "plugins-IU-211.xml");
    assert_eq!(records[0].entries, 1);
    assert!(records[0].published_at > 0);
}

#[test]
fn failed_document_rename_keeps_new_entries_protected() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");
    let blocker = fx.store.base_path().join("plugins-IC-203.xml");
    std::fs::create_dir_all(blocker.join("occupied")).unwrap();

    let catalog = local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]);
    let err = fx.store.publish_catalog(&catalog).unwrap_err();
    assert!(matches!(err, StoreError::Persist { .. }));

    // Whatever document ends up live, its artifacts must survive retirement.
    let report = fx.store.retire_unreferenced(&HashSet::new()).unwrap();
    assert!(report.retired.is_empty());
    assert!(fx.store.lookup(&foo.key).unwrap().is_some());

    std::fs::remove_dir_all(&blocker).unwrap();
    let published = fx.store.publish_catalog(&catalog).unwrap();
    assert!(published.path.is_file());
    assert_eq!(
        fx.store
            .published_keys(&ProductVersion::new("IC-203.1"))
            .unwrap(),
        HashSet::from([foo.key])
    );
}

#[test]
fn publish_rejects_dangling_reference_and_keeps_previous() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");
    let first = fx
        .store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();
    let before = std::fs::read_to_string(&first.path).unwrap();

    let ghost = StoredArtifact {
        key: ArtifactKey::new("ghost", "1.0"),
        checksum: checksum_of(b"ghost"),
        relative_path: "nowhere/ghost.zip".into(),
        size: 5,
        completed_at: 0,
    };
    let err = fx
        .store
        .publish_catalog(&local_catalog(
            "IC-203.1",
            &[("foo", "1.0", "foo", &foo), ("ghost", "1.0", "ghost", &ghost)],
        ))
        .unwrap_err();

    assert!(matches!(err, StoreError::DanglingReference(key) if key.plugin_id == "ghost"));
    assert_eq!(std::fs::read_to_string(&first.path).unwrap(), before);
    assert_eq!(
        fx.store
            .published_keys(&ProductVersion::new("IC-203.1"))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn republish_replaces_entries() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");
    let foo2 = commit(&fx.store, "foo", "1.1", b"foo2");

    fx.store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();
    fx.store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.1", "foo2", &foo2)]))
        .unwrap();

    assert_eq!(
        fx.store
            .published_keys(&ProductVersion::new("IC-203.1"))
            .unwrap(),
        HashSet::from([foo2.key])
    );
}

#[test]
fn withdraw_keeps_shared_document() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");

    // Both builds render to plugins-IC-203.xml.
    fx.store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();
    let shared = fx
        .store
        .publish_catalog(&local_catalog("IC-203.2", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();

    fx.store
        .withdraw_catalog(&ProductVersion::new("IC-203.1"))
        .unwrap();
    assert!(shared.path.exists());
    assert_eq!(
        fx.store.published_versions().unwrap(),
        vec![ProductVersion::new("IC-203.2")]
    );

    fx.store
        .withdraw_catalog(&ProductVersion::new("IC-203.2"))
        .unwrap();
    assert!(!shared.path.exists());
    assert!(fx.store.published_versions().unwrap().is_empty());
}

#[test]
fn withdraw_unknown_version_is_a_no_op() {
    let fx = create_store();
    fx.store
        .withdraw_catalog(&ProductVersion::new("IU-999.1"))
        .unwrap();
}

#[test]
fn retire_removes_unreferenced_and_sweeps_strays() {
    let fx = create_store();
    let keep = commit(&fx.store, "keep", "1.0", b"keep");
    let drop_me = commit(&fx.store, "drop", "1.0", b"drop");

    let stray_dir = fx.store.storage_path().join("stray").join("dir");
    std::fs::create_dir_all(&stray_dir).unwrap();
    std::fs::write(stray_dir.join("old.zip"), b"old").unwrap();
    std::fs::write(fx.store.storage_path().join("loose.txt"), b"x").unwrap();

    let report = fx
        .store
        .retire_unreferenced(&HashSet::from([keep.key.clone()]))
        .unwrap();

    assert_eq!(report.retired, vec![drop_me.key.clone()]);
    assert_eq!(report.swept, 2);
    assert!(fx.store.lookup(&keep.key).unwrap().is_some());
    assert_eq!(fx.store.lookup(&drop_me.key).unwrap(), None);
    assert!(!fx.store.storage_path().join("stray").exists());
    assert!(
        fx.store.storage_path().join("loose.txt").exists(),
        "plain files at the storage root are not ours to remove"
    );

    let drop_dir = plugin_mirror_store::layout::escape_component("drop");
    assert!(!fx.store.storage_path().join(drop_dir).exists());
    assert!(fx.store.storage_path().join(".mirror").exists());
}

#[test]
fn retire_never_removes_published_artifacts() {
    let fx = create_store();
    let foo = commit(&fx.store, "foo", "1.0", b"foo");
    fx.store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();

    let report = fx.store.retire_unreferenced(&HashSet::new()).unwrap();

    assert!(report.retired.is_empty());
    assert!(fx.store.lookup(&foo.key).unwrap().is_some());
}

#[test]
fn retire_keeps_old_file_a_published_catalog_still_uses() {
    let fx = create_store();
    let old = commit(&fx.store, "foo", "1.0", b"old");
    fx.store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "old", &old)]))
        .unwrap();

    // Upstream re-released the same version under a new file name.
    let mut fetched = stage(&fx.store, "foo", "1.0", b"newer");
    fetched.file_name = "foo-1.0-rebuild.zip".into();
    fx.store.commit_artifact(fetched).unwrap();

    fx.store
        .retire_unreferenced(&HashSet::from([old.key.clone()]))
        .unwrap();

    let old_path = plugin_mirror::artifact::absolute_path(fx.store.storage_path(), &old);
    assert!(old_path.exists(), "published catalog still points at the old file");
}

#[test]
fn retire_spares_catalogs_in_the_storage_root() {
    let root = tempfile::tempdir().unwrap();
    let store = FsMirrorStore::open(
        root.path().join("mirror"),
        root.path().join("mirror"),
        "https://mirror.test/",
    )
    .unwrap();
    let foo = commit(&store, "foo", "1.0", b"foo");
    let gone = commit(&store, "gone", "1.0", b"gone");
    let published = store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();

    let report = store.retire_unreferenced(&HashSet::new()).unwrap();

    assert_eq!(report.retired, vec![gone.key]);
    assert!(published.path.is_file());
    assert!(store.lookup(&foo.key).unwrap().is_some());
}

#[test]
fn retire_spares_catalog_dir_nested_in_storage() {
    let root = tempfile::tempdir().unwrap();
    let storage = root.path().join("mirror");
    let store = FsMirrorStore::open(
        storage.join("meta").join("catalogs"),
        &storage,
        "https://mirror.test/",
    )
    .unwrap();
    let foo = commit(&store, "foo", "1.0", b"foo");
    let published = store
        .publish_catalog(&local_catalog("IC-203.1", &[("foo", "1.0", "foo", &foo)]))
        .unwrap();
    std::fs::write(storage.join("meta").join("stray.bin"), b"x").unwrap();

    let report = store.retire_unreferenced(&HashSet::new()).unwrap();

    assert!(published.path.is_file());
    assert!(!storage.join("meta").join("stray.bin").exists());
    assert_eq!(report.swept, 1);
}

#[test]
fn reopen_clears_stale_staging_and_keeps_index() {
    let root = tempfile::tempdir().unwrap();
    let open = || {
        FsMirrorStore::open(
            root.path().join("catalogs"),
            root.path().join("plugins"),
            "https://mirror.test/plugins/",
        )
        .unwrap()
    };

    let store = open();
    let stored = commit(&store, "foo", "1.0", b"foo");
    std::fs::write(store.staging_dir().join(".download-crashed"), b"partial").unwrap();
    drop(store);

    let store = open();
    assert_eq!(std::fs::read_dir(store.staging_dir()).unwrap().count(), 0);
    assert_eq!(store.lookup(&stored.key).unwrap(), Some(stored));
}
