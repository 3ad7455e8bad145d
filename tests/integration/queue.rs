use tokio::io::AsyncWriteExt;

use crate::*;

/// Messages from different sockets come out in the order they arrived:
/// A, B, A.
#[tokio::test]
async fn queue_preserves_arrival_order_across_sockets() {
    let node = start_node("queue-order", 4).await;
    let addr = node.local_addr();

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    wait_until("both connections admitted", || node.table().occupied() == 2)
        .await
        .unwrap();

    a.write_all(b"first from a\0").await.unwrap();
    wait_until("first message queued", || node.queue().len() == 1)
        .await
        .unwrap();
    b.write_all(b"only from b\0").await.unwrap();
    wait_until("second message queued", || node.queue().len() == 2)
        .await
        .unwrap();
    a.write_all(b"second from a\0").await.unwrap();
    wait_until("third message queued", || node.queue().len() == 3)
        .await
        .unwrap();

    let one = node.queue().try_dequeue().unwrap();
    let two = node.queue().try_dequeue().unwrap();
    let three = node.queue().try_dequeue().unwrap();

    assert_eq!(one.text, "first from a");
    assert_eq!(two.text, "only from b");
    assert_eq!(three.text, "second from a");
    assert_eq!(one.socket_id, three.socket_id);
    assert_ne!(one.socket_id, two.socket_id);
    assert!(node.queue().try_dequeue().is_err());

    stop(&[&node]).await;
}

/// Several messages in a single write are split at their terminators.
#[tokio::test]
async fn back_to_back_messages_are_split() {
    let node = start_node("queue-split", 4).await;
    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();

    stream.write_all(b"one\0two\0three\0").await.unwrap();
    let mut texts = Vec::new();
    for _ in 0..3 {
        let msg = node.queue().recv_timeout(WAIT).await.unwrap();
        texts.push(msg.text);
    }
    assert_eq!(texts, vec!["one", "two", "three"]);

    stop(&[&node]).await;
}
