use harbor::Session;
use harbor_mocks::MockServer;

#[tokio::test]
async fn sequential_requests_reuse_one_connection() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    for _ in 0..5 {
        let res = session.get(server.url("/get")).send().await.unwrap();
        assert_eq!(res.status(), 200);
    }

    assert_eq!(server.total_connections(), 1);
    assert_eq!(session.pooled_connections(server.url("/get")), 1);
}

#[tokio::test]
async fn concurrent_requests_respect_the_pool_cap() {
    let server = MockServer::spawn().await;
    let session = Session::builder().pool_limit_per_host(4).build();

    // One long, slow chunked download...
    let long = {
        let session = session.clone();
        let url = server.url("/drip?numbytes=4096&chunks=16&delay_ms=20");
        tokio::spawn(async move {
            let res = session.get(url).send().await.unwrap();
            res.bytes().len()
        })
    };

    // ...concurrently with ten short requests against the same host.
    let mut short = Vec::new();
    for _ in 0..10 {
        let session = session.clone();
        let url = server.url("/get");
        short.push(tokio::spawn(async move {
            session.get(url).send().await.unwrap().status()
        }));
    }

    for handle in short {
        assert_eq!(handle.await.unwrap(), 200);
    }
    let total_size = long.await.unwrap();
    assert_eq!(total_size, 4096);

    assert!(
        server.peak_connections() <= 4,
        "peak {} exceeded the cap",
        server.peak_connections()
    );
    assert!(session.pooled_connections(server.url("/")) <= 4);
}

#[tokio::test]
async fn connection_close_responses_are_not_reused() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session.get(server.url("/close")).send().await.unwrap();
    assert_eq!(res.text().unwrap(), "closed");
    assert_eq!(session.pooled_connections(server.url("/")), 0);

    // The next request dials a fresh connection.
    let res = session.get(server.url("/get")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(server.total_connections(), 2);
}

#[tokio::test]
async fn dropped_stream_closes_undrained_connection() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let stream = session
        .get(server.url("/drip?numbytes=65536&chunks=32&delay_ms=50"))
        .ropen()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    drop(stream);

    // The undrained connection was retired rather than parked idle.
    assert_eq!(session.pooled_connections(server.url("/")), 0);

    let res = session.get(server.url("/get")).send().await.unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn closed_stream_cancels_reading() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let mut stream = session
        .get(server.url("/drip?numbytes=65536&chunks=64&delay_ms=20"))
        .ropen()
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let n = stream.read_some(&mut buf).await.unwrap();
    assert!(n > 0);

    stream.close();
    // Closing again is a no-op.
    stream.close();
    let err = stream.read_some(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), harbor::ErrorKind::Cancelled);
}

#[tokio::test]
async fn cancelled_request_releases_pool_capacity() {
    let server = MockServer::spawn().await;
    let session = Session::builder().pool_limit_per_host(1).build();

    let slow = {
        let session = session.clone();
        let url = server.url("/drip?numbytes=1024&chunks=4&delay_ms=30");
        tokio::spawn(async move { session.get(url).send().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // This acquire parks behind the busy connection, then is cancelled.
    let parked = {
        let session = session.clone();
        let url = server.url("/get");
        tokio::spawn(async move { session.get(url).send().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    parked.abort();
    let _ = parked.await;

    // The slow request still completes and capacity is intact.
    let res = slow.await.unwrap().unwrap();
    assert_eq!(res.bytes().len(), 1024);

    let res = session.get(server.url("/get")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(session.pooled_connections(server.url("/")) <= 1);
}

#[tokio::test]
async fn waiters_complete_in_request_order() {
    let server = MockServer::spawn().await;
    let session = Session::builder().pool_limit_per_host(1).build();

    // Occupy the single connection.
    let first = {
        let session = session.clone();
        let url = server.url("/drip?numbytes=256&chunks=4&delay_ms=25");
        tokio::spawn(async move { session.get(url).send().await.unwrap().status() })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..4 {
        let session = session.clone();
        let url = server.url("/get");
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let res = session.get(url).send().await.unwrap();
            assert_eq!(res.status(), 200);
            order.lock().unwrap().push(i);
        }));
        // Stagger enqueue so the FIFO order is deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
    }

    assert_eq!(first.await.unwrap(), 200);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}
