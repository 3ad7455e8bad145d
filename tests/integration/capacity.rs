use tokio::io::AsyncReadExt;

use ferry_core::message::BUSY_MESSAGE;

use crate::*;

/// With room for two connections, the third is told the server is busy and
/// hung up on; the table never grows past its limit.
#[tokio::test]
async fn connection_over_limit_gets_busy_message() {
    let node = start_node("cap-busy", 2).await;
    let addr = node.local_addr();

    let _first = TcpStream::connect(addr).await.unwrap();
    wait_until("first connection admitted", || node.table().occupied() == 1)
        .await
        .unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    wait_until("second connection admitted", || node.table().occupied() == 2)
        .await
        .unwrap();

    let mut third = TcpStream::connect(addr).await.unwrap();
    assert_eq!(read_message(&mut third).await.unwrap(), BUSY_MESSAGE);

    let mut rest = Vec::new();
    let eof = tokio::time::timeout(WAIT, third.read_to_end(&mut rest))
        .await
        .expect("refused connection closed");
    assert!(eof.is_ok());
    assert!(rest.is_empty());

    assert_eq!(node.table().occupied(), 2);
    assert!(node.table().is_full());
    // Two clients plus the primary listener.
    assert_eq!(node.table().len(), 3);

    stop(&[&node]).await;
}

/// A slot freed by a disconnect is handed to the next caller.
#[tokio::test]
async fn slot_is_reused_after_disconnect() {
    let node = start_node("cap-reuse", 1).await;
    let addr = node.local_addr();

    let first = TcpStream::connect(addr).await.unwrap();
    wait_until("first connection admitted", || node.table().occupied() == 1)
        .await
        .unwrap();
    drop(first);
    wait_until("first connection reaped", || node.table().occupied() == 0)
        .await
        .unwrap();

    let _second = TcpStream::connect(addr).await.unwrap();
    wait_until("second connection admitted", || node.table().occupied() == 1)
        .await
        .unwrap();
    assert_eq!(node.table().max_connections(), 1);

    stop(&[&node]).await;
}

/// Outbound connections count against the same limit.
#[tokio::test]
async fn outbound_connect_respects_limit() {
    let target = start_node("cap-target", 4).await;
    let node = start_node("cap-outbound", 1).await;
    let port = target.public_port();

    node.connect(Some("a"), "127.0.0.1", port).await.unwrap();
    let refused = node.connect(Some("b"), "127.0.0.1", port).await;
    assert!(matches!(refused, Err(ferryd::NodeError::Table(_))));
    assert_eq!(node.table().occupied(), 1);

    stop(&[&node, &target]).await;
}
