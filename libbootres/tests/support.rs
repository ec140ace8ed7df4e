use libbootres::{BootResourceStore, CommitOutcome, Digest};

/// Three files shaped like an ephemeral boot image for `series`.
#[allow(dead_code)]
pub fn image_files(series: &str) -> Vec<(String, Vec<u8>)> {
    ["boot-kernel", "boot-initrd", "squashfs"]
        .iter()
        .map(|name| (name.to_string(), format!("{series}/{name}").into_bytes()))
        .collect()
}

/// Write `files` into a new generation with correct digests and commit it.
#[allow(dead_code)]
pub async fn commit_files(store: &BootResourceStore, files: &[(String, Vec<u8>)]) -> CommitOutcome {
    let id = store.begin_generation().await.unwrap();
    for (path, bytes) in files {
        store
            .write_file(id, path, bytes, &Digest::of(bytes))
            .await
            .unwrap();
    }
    store.commit(id).await.unwrap()
}
