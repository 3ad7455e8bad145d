use ferry_services::DownloadStatus;
use ferryd::TransferEvent;

use crate::*;

/// Wait on `completions` for the download of `file_id` to finish.
async fn await_download(
    mut completions: tokio::sync::broadcast::Receiver<TransferEvent>,
    file_id: u32,
) -> PathBuf {
    let wait = async {
        loop {
            match completions.recv().await.expect("completion channel open") {
                TransferEvent::Received { file_id: id, path } if id == file_id => return path,
                TransferEvent::Failed { file_id: id, reason } if id == file_id => {
                    panic!("download failed: {reason}")
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("download finished in time")
}

/// report.pdf, 5000 bytes: 12 chunks at the default capacity, end to end
/// through the directory, the owner, and the requester.
#[tokio::test]
async fn report_pdf_transfers_end_to_end() {
    let (dir, _task, addr) = start_directory("xfer-dir").await;
    let share = scratch_dir("xfer-share");
    let content: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(share.join("report.pdf"), &content).unwrap();

    let owner = start_client("xfer-owner", &addr).await;
    owner.share(&[share.join("report.pdf")]).await.unwrap();
    assert_eq!(
        next_text(&owner).await,
        "1 files successfully added to file listing."
    );
    let mut served = owner.node().subscribe_completions();

    let requester = start_client("xfer-requester", &addr).await;
    let done = requester.node().subscribe_completions();
    requester.request_file(1).await.unwrap();
    let path = await_download(done, 1).await;

    assert_eq!(path.file_name().unwrap(), "report.pdf");
    assert_eq!(std::fs::read(&path).unwrap(), content);

    let record = requester.node().downloads().get(1).unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.total_chunks, 12);
    assert!(requester
        .node()
        .downloads()
        .progress_report()
        .contains("report.pdf"));

    match tokio::time::timeout(WAIT, served.recv()).await.unwrap().unwrap() {
        TransferEvent::Sent { file_id, chunks, .. } => {
            assert_eq!(file_id, 1);
            assert_eq!(chunks, 12);
        }
        other => panic!("unexpected owner event: {other:?}"),
    }

    // The per-download connection is hung up once the file is whole.
    wait_until("transfer socket closed", || {
        requester.node().table().find_by_name("1").is_none()
    })
    .await
    .unwrap();

    stop(&[owner.node(), requester.node(), &dir]).await;
}

#[tokio::test]
async fn small_and_empty_files_transfer() {
    let (dir, _task, addr) = start_directory("xfer-small-dir").await;
    let share = scratch_dir("xfer-small-share");
    std::fs::write(share.join("empty.txt"), b"").unwrap();
    std::fs::write(share.join("one.txt"), b"fits in a single chunk").unwrap();

    let owner = start_client("xfer-small-owner", &addr).await;
    owner.share(&[share.clone()]).await.unwrap();
    next_text(&owner).await;

    let requester = start_client("xfer-small-requester", &addr).await;

    // Listing order is by name: empty.txt is 1, one.txt is 2.
    let events = requester.node().subscribe_completions();
    requester.request_file(1).await.unwrap();
    let empty = await_download(events, 1).await;
    assert_eq!(std::fs::read(&empty).unwrap(), b"");

    let events = requester.node().subscribe_completions();
    requester.request_file(2).await.unwrap();
    let one = await_download(events, 2).await;
    assert_eq!(std::fs::read(&one).unwrap(), b"fits in a single chunk");

    stop(&[owner.node(), requester.node(), &dir]).await;
}

#[tokio::test]
async fn repeated_download_does_not_overwrite() {
    let (dir, _task, addr) = start_directory("xfer-again-dir").await;
    let share = scratch_dir("xfer-again-share");
    std::fs::write(share.join("data.csv"), b"a,b\n1,2\n").unwrap();

    let owner = start_client("xfer-again-owner", &addr).await;
    owner.share(&[share.join("data.csv")]).await.unwrap();
    next_text(&owner).await;

    let requester = start_client("xfer-again-requester", &addr).await;

    let events = requester.node().subscribe_completions();
    requester.request_file(1).await.unwrap();
    let first = await_download(events, 1).await;

    let events = requester.node().subscribe_completions();
    requester.request_file(1).await.unwrap();
    let second = await_download(events, 1).await;

    assert_ne!(first, second);
    assert_eq!(second.file_name().unwrap(), "data (1).csv");
    assert_eq!(std::fs::read(&second).unwrap(), b"a,b\n1,2\n");

    stop(&[owner.node(), requester.node(), &dir]).await;
}
