mod common;

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use file_share::lifecycle::{AccessDecision, DeclaredFile, FilePart, LifecycleError, NewUpload};
use file_share::storage::models::{FileStatus, Upload};

use common::{body, part, read_all, TestEnv};

const ADMIN: AccessDecision = AccessDecision::UploadAdmin;
const ANONYMOUS: AccessDecision = AccessDecision::Anonymous;

fn declared(names: &[&str]) -> Vec<DeclaredFile> {
    names
        .iter()
        .map(|name| DeclaredFile {
            name: name.to_string(),
        })
        .collect()
}

fn new_upload(env: &TestEnv, params: NewUpload) -> Upload {
    let (upload, _) = env.lifecycle.create_upload(params, None).unwrap();
    upload
}

async fn wait_until_gone(env: &TestEnv, upload_id: &str) {
    for _ in 0..100 {
        if matches!(env.lifecycle.get_upload(upload_id), Err(LifecycleError::NotFound(_))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("upload {upload_id} was never removed");
}

#[tokio::test]
async fn test_upload_then_download() {
    let env = TestEnv::new();
    let upload = new_upload(&env, NewUpload::default());

    let file = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("hello.txt", b"hello"))
        .await
        .unwrap();

    assert_eq!(file.status, FileStatus::Uploaded);
    assert_eq!(file.size, 5);
    assert_eq!(file.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    assert!(file.mime_type.starts_with("text/plain"));
    assert!(file.backend_details.is_empty());

    let upload = env.lifecycle.get_upload(&upload.id).unwrap();
    let record = env
        .lifecycle
        .get_file_record(&upload, &file.id, Some("hello.txt"))
        .unwrap();
    let download = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
    assert_eq!(read_all(download.body.unwrap()).await, b"hello");

    // Regular files can be downloaded again.
    let again = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
    assert_eq!(read_all(again.body.unwrap()).await, b"hello");
}

#[tokio::test]
async fn test_file_lookup_checks_name() {
    let env = TestEnv::new();
    let upload = new_upload(&env, NewUpload::default());
    let file = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();

    let result = env.lifecycle.get_file_record(&upload, &file.id, Some("b.txt"));
    assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    let result = env.lifecycle.get_file_record(&upload, "nope", None);
    assert!(matches!(result, Err(LifecycleError::NotFound(_))));
}

#[tokio::test]
async fn test_one_shot_download_happens_once() {
    let env = TestEnv::new();
    let upload = new_upload(
        &env,
        NewUpload {
            one_shot: true,
            ..NewUpload::default()
        },
    );
    let file = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("secret.txt", b"secret"))
        .await
        .unwrap();
    let record = env.lifecycle.get_file_record(&upload, &file.id, None).unwrap();

    // A probe claims nothing.
    let probe = env.lifecycle.get_file(&upload, &record, true).await.unwrap();
    assert!(probe.body.is_none());

    let (first, second) = tokio::join!(
        env.lifecycle.get_file(&upload, &record, false),
        env.lifecycle.get_file(&upload, &record, false),
    );
    let (winner, loser) = match (first, second) {
        (Ok(download), Err(e)) | (Err(e), Ok(download)) => (download, e),
        _ => panic!("exactly one download must succeed"),
    };
    assert!(matches!(loser, LifecycleError::NotFound(_)));
    assert_eq!(read_all(winner.body.unwrap()).await, b"secret");

    wait_until_gone(&env, &upload.id).await;
    assert!(!env.files_dir().join(&upload.id).join(file.data_key()).exists());
}

#[tokio::test]
async fn test_file_quota() {
    let env = TestEnv::with_config(|config| config.limits.max_file_per_upload = 1);

    let result = env.lifecycle.create_upload(
        NewUpload {
            files: declared(&["a.txt", "b.txt"]),
            ..NewUpload::default()
        },
        None,
    );
    assert!(matches!(result, Err(LifecycleError::QuotaExceeded(_))));

    let upload = new_upload(&env, NewUpload::default());
    env.lifecycle
        .add_file(&upload, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();
    let result = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("b.txt", b"b"))
        .await;
    assert!(matches!(result, Err(LifecycleError::QuotaExceeded(_))));
    assert_eq!(env.lifecycle.upload_files(&upload).unwrap().len(), 1);
}

#[tokio::test]
async fn test_file_too_big_stays_uploading() {
    let env = TestEnv::with_config(|config| config.limits.max_file_size = 10);
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["big.bin"]),
            ..NewUpload::default()
        },
    );
    let files = env.lifecycle.upload_files(&upload).unwrap();

    let result = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&files[0].id), part("big.bin", b"0123456789a"))
        .await;
    assert!(matches!(result, Err(LifecycleError::TooBig(10))));

    let record = env.lifecycle.get_file_record(&upload, &files[0].id, None).unwrap();
    assert_eq!(record.status, FileStatus::Uploading);
    assert!(!env.files_dir().join(&upload.id).join(record.data_key()).exists());

    // Not abandoned yet.
    let result = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&record.id), part("big.bin", b"small"))
        .await;
    assert!(matches!(result, Err(LifecycleError::Conflict(_))));
}

#[tokio::test]
async fn test_abandoned_upload_can_be_restarted() {
    let env = TestEnv::with_config(|config| {
        config.limits.max_file_size = 10;
        config.limits.uploading_timeout_secs = 0;
    });
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["f.bin"]),
            ..NewUpload::default()
        },
    );
    let file_id = env.lifecycle.upload_files(&upload).unwrap()[0].id.clone();

    let result = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("f.bin", b"way too big for this"))
        .await;
    assert!(matches!(result, Err(LifecycleError::TooBig(_))));

    let file = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("f.bin", b"fits"))
        .await
        .unwrap();
    assert_eq!(file.status, FileStatus::Uploaded);
    assert_eq!(file.size, 4);
}

#[tokio::test]
async fn test_concurrent_adds_have_one_winner() {
    let env = TestEnv::new();
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["race.txt"]),
            ..NewUpload::default()
        },
    );
    let file_id = env.lifecycle.upload_files(&upload).unwrap()[0].id.clone();

    let (first, second) = tokio::join!(
        env.lifecycle
            .add_file(&upload, ADMIN, Some(&file_id), part("race.txt", b"first")),
        env.lifecycle
            .add_file(&upload, ADMIN, Some(&file_id), part("race.txt", b"second")),
    );
    let (winner, loser) = match (first, second) {
        (Ok(file), Err(e)) | (Err(e), Ok(file)) => (file, e),
        _ => panic!("exactly one upload must succeed"),
    };
    assert!(matches!(loser, LifecycleError::Conflict(_)));
    assert_eq!(winner.status, FileStatus::Uploaded);

    let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
    let download = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
    let content = read_all(download.body.unwrap()).await;
    assert_eq!(content.len() as u64, winner.size);
}

#[tokio::test]
async fn test_declared_file_name_must_match() {
    let env = TestEnv::new();
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["a.txt"]),
            ..NewUpload::default()
        },
    );
    let file_id = env.lifecycle.upload_files(&upload).unwrap()[0].id.clone();

    let result = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("b.txt", b"b"))
        .await;
    assert!(matches!(result, Err(LifecycleError::InvalidParameter(_))));

    let nameless = FilePart {
        name: None,
        body: body(b"x"),
    };
    let result = env.lifecycle.add_file(&upload, ADMIN, None, nameless).await;
    assert!(matches!(result, Err(LifecycleError::MissingParameter(_))));

    let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
    assert_eq!(record.status, FileStatus::Missing);
}

#[tokio::test]
async fn test_anonymous_callers_are_limited() {
    let env = TestEnv::new();
    let locked = new_upload(&env, NewUpload::default());

    let result = env
        .lifecycle
        .add_file(&locked, ANONYMOUS, None, part("a.txt", b"a"))
        .await;
    assert!(matches!(result, Err(LifecycleError::Forbidden(_))));

    let file = env
        .lifecycle
        .add_file(&locked, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();
    let result = env.lifecycle.remove_file(&locked, &file, ANONYMOUS).await;
    assert!(matches!(result, Err(LifecycleError::Forbidden(_))));
    let result = env.lifecycle.remove_upload(&locked, ANONYMOUS).await;
    assert!(matches!(result, Err(LifecycleError::Forbidden(_))));

    let removable = new_upload(
        &env,
        NewUpload {
            removable: true,
            ..NewUpload::default()
        },
    );
    env.lifecycle.remove_upload(&removable, ANONYMOUS).await.unwrap();
    assert!(matches!(
        env.lifecycle.get_upload(&removable.id),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_file_twice_is_a_no_op() {
    let env = TestEnv::new();
    let upload = new_upload(&env, NewUpload::default());
    let first = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();
    env.lifecycle
        .add_file(&upload, ADMIN, None, part("b.txt", b"b"))
        .await
        .unwrap();

    let removed = env.lifecycle.remove_file(&upload, &first, ADMIN).await.unwrap();
    assert_eq!(removed.status, FileStatus::Removed);
    assert_eq!(env.store.removals(), 1);

    let record = env.lifecycle.get_file_record(&upload, &first.id, None).unwrap();
    assert_eq!(record.status, FileStatus::Deleted);
    assert!(!env.files_dir().join(&upload.id).join(first.data_key()).exists());

    let again = env.lifecycle.remove_file(&upload, &record, ADMIN).await.unwrap();
    assert_eq!(again.status, FileStatus::Deleted);
    assert_eq!(env.store.removals(), 1);

    let result = env.lifecycle.get_file(&upload, &record, false).await;
    assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    // The other file keeps the upload alive.
    assert!(env.lifecycle.get_upload(&upload.id).is_ok());
}

#[tokio::test]
async fn test_remove_uploading_file_conflicts() {
    let env = TestEnv::with_config(|config| config.limits.max_file_size = 1);
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["a.txt"]),
            ..NewUpload::default()
        },
    );
    let file_id = env.lifecycle.upload_files(&upload).unwrap()[0].id.clone();
    let _ = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("a.txt", b"too big"))
        .await;

    let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
    let result = env.lifecycle.remove_file(&upload, &record, ADMIN).await;
    assert!(matches!(result, Err(LifecycleError::Conflict(_))));

    // Removing the whole upload still works.
    env.lifecycle.remove_upload(&upload, ADMIN).await.unwrap();
    assert!(env.lifecycle.get_upload(&upload.id).is_err());
}

#[tokio::test]
async fn test_remove_upload_deletes_everything() {
    let env = TestEnv::new();
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["declared.txt"]),
            ..NewUpload::default()
        },
    );
    let a = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();
    let b = env
        .lifecycle
        .add_file(&upload, ADMIN, None, part("b.txt", b"b"))
        .await
        .unwrap();
    assert!(env.files_dir().join(&upload.id).join(a.data_key()).exists());

    env.lifecycle.remove_upload(&upload, ADMIN).await.unwrap();

    assert!(matches!(
        env.lifecycle.get_upload(&upload.id),
        Err(LifecycleError::NotFound(_))
    ));
    assert!(!env.files_dir().join(&upload.id).join(a.data_key()).exists());
    assert!(!env.files_dir().join(&upload.id).join(b.data_key()).exists());
}

#[tokio::test]
async fn test_expired_uploads_are_swept() {
    let env = TestEnv::new();
    let expiring = new_upload(
        &env,
        NewUpload {
            ttl: 3600,
            ..NewUpload::default()
        },
    );
    let file = env
        .lifecycle
        .add_file(&expiring, ADMIN, None, part("a.txt", b"a"))
        .await
        .unwrap();
    let lasting = new_upload(
        &env,
        NewUpload {
            ttl: 30 * 24 * 3600,
            ..NewUpload::default()
        },
    );

    let now = Utc::now() + chrono::Duration::hours(2);
    let processed = env.lifecycle.remove_expired_uploads(now).await.unwrap();
    assert_eq!(processed, 1);

    assert!(env.lifecycle.get_upload(&expiring.id).is_err());
    assert!(!env.files_dir().join(&expiring.id).join(file.data_key()).exists());
    assert!(env.lifecycle.get_upload(&lasting.id).is_ok());

    let processed = env.lifecycle.remove_expired_uploads(now).await.unwrap();
    assert_eq!(processed, 0);
}

#[tokio::test]
async fn test_expired_upload_is_not_found() {
    let env = TestEnv::new();
    let upload = new_upload(
        &env,
        NewUpload {
            ttl: 60,
            ..NewUpload::default()
        },
    );

    env.lifecycle
        .state()
        .metadata
        .update_upload(&upload.id, &mut |u: &mut Upload| {
            u.created_at = Utc::now() - chrono::Duration::hours(1);
            Ok(())
        })
        .unwrap();

    assert!(matches!(
        env.lifecycle.get_upload(&upload.id),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stream_upload_reaches_one_downloader() {
    let env = TestEnv::new();
    let (upload, files) = env
        .lifecycle
        .create_upload(
            NewUpload {
                stream: true,
                files: declared(&["live.txt"]),
                ..NewUpload::default()
            },
            None,
        )
        .unwrap();
    assert!(upload.one_shot);
    let file_id = files[0].id.clone();

    let uploader = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("live.txt", b"streamed content"));

    let downloader = async {
        let record = loop {
            let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
            if record.status == FileStatus::Uploading {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let download = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
        let content = read_all(download.body.unwrap()).await;

        // Somebody else arriving late gets nothing.
        let late = env.lifecycle.get_file(&upload, &record, false).await;
        assert!(matches!(late, Err(LifecycleError::NotFound(_))));
        content
    };

    let (uploaded, content) = tokio::join!(uploader, downloader);
    let uploaded = uploaded.unwrap();
    assert_eq!(content, b"streamed content");
    assert_eq!(uploaded.status, FileStatus::Deleted);
    assert_eq!(uploaded.size, 16);

    assert!(matches!(
        env.lifecycle.get_upload(&upload.id),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stale_attempt_keeps_restarted_content() {
    let env = TestEnv::with_config(|config| config.limits.uploading_timeout_secs = 0);
    let upload = new_upload(
        &env,
        NewUpload {
            files: declared(&["slow.bin"]),
            ..NewUpload::default()
        },
    );
    let file_id = env.lifecycle.upload_files(&upload).unwrap()[0].id.clone();

    let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, io::Error>>();
    tx.unbounded_send(Ok(Bytes::from_static(b"aaaa"))).unwrap();
    let slow = env.lifecycle.add_file(
        &upload,
        ADMIN,
        Some(&file_id),
        FilePart {
            name: Some("slow.bin".to_string()),
            body: rx,
        },
    );

    let restart = async {
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
            if record.status == FileStatus::Uploading {
                break;
            }
        }
        let file = env
            .lifecycle
            .add_file(&upload, ADMIN, Some(&file_id), part("slow.bin", b"BBBB"))
            .await;
        // Let the first attempt complete its transfer.
        drop(tx);
        file
    };

    let (slow, restarted) = tokio::join!(slow, restart);
    assert!(matches!(slow, Err(LifecycleError::Conflict(_))));
    assert_eq!(restarted.unwrap().status, FileStatus::Uploaded);

    let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
    let download = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
    assert_eq!(read_all(download.body.unwrap()).await, b"BBBB");
}

#[tokio::test]
async fn test_broken_stream_still_drops_upload() {
    let env = TestEnv::new();
    let (upload, files) = env
        .lifecycle
        .create_upload(
            NewUpload {
                stream: true,
                files: declared(&["live.bin"]),
                ..NewUpload::default()
            },
            None,
        )
        .unwrap();
    let file_id = files[0].id.clone();

    let content = vec![b'z'; 64 * 1024];
    let uploader = env
        .lifecycle
        .add_file(&upload, ADMIN, Some(&file_id), part("live.bin", &content));

    let downloader = async {
        let record = loop {
            let record = env.lifecycle.get_file_record(&upload, &file_id, None).unwrap();
            if record.status == FileStatus::Uploading {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let download = env.lifecycle.get_file(&upload, &record, false).await.unwrap();
        // Hang up before reading anything.
        drop(download);
    };

    let (uploaded, ()) = tokio::join!(uploader, downloader);
    assert!(uploaded.is_err());
    assert!(matches!(
        env.lifecycle.get_upload(&upload.id),
        Err(LifecycleError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_races_one_shot_download() {
    for remove_first in [true, false] {
        let env = TestEnv::new();
        let upload = new_upload(
            &env,
            NewUpload {
                one_shot: true,
                ..NewUpload::default()
            },
        );
        let file = env
            .lifecycle
            .add_file(&upload, ADMIN, None, part("secret.txt", b"secret"))
            .await
            .unwrap();
        let record = env.lifecycle.get_file_record(&upload, &file.id, None).unwrap();

        let download = async {
            match env.lifecycle.get_file(&upload, &record, false).await {
                Ok(download) => Some(read_all(download.body.unwrap()).await),
                Err(e) => {
                    assert!(matches!(e, LifecycleError::NotFound(_)), "{e}");
                    None
                }
            }
        };
        let remove = env.lifecycle.remove_file(&upload, &record, ADMIN);

        let (downloaded, removed) = if remove_first {
            let (removed, downloaded) = tokio::join!(remove, download);
            (downloaded, removed)
        } else {
            tokio::join!(download, remove)
        };
        removed.unwrap();
        if let Some(content) = downloaded {
            assert_eq!(content, b"secret");
        }

        wait_until_gone(&env, &upload.id).await;
        assert_eq!(env.store.removals(), 1);
        assert!(!env.files_dir().join(&upload.id).join(file.data_key()).exists());
    }
}

#[tokio::test]
async fn test_store_failure_wins_over_broken_relay() {
    let env = TestEnv::new();
    env.store.fail_writes.store(true, Ordering::SeqCst);
    let upload = new_upload(&env, NewUpload::default());

    let chunks =
        futures::stream::iter((0..4).map(|_| Ok::<_, io::Error>(Bytes::from_static(b"abcd"))));
    let result = env
        .lifecycle
        .add_file(
            &upload,
            ADMIN,
            None,
            FilePart {
                name: Some("a.txt".to_string()),
                body: chunks,
            },
        )
        .await;
    assert!(matches!(result, Err(LifecycleError::Data(_))), "{result:?}");
}
