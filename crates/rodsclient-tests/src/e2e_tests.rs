//! Full connection scenarios against the scripted server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rodsclient_proto::frame::msg_type;
use rodsclient_proto::message::{EmptyResponse, TicketAdminRequest};
use rodsclient_proto::{Message, NegotiationPolicy, NegotiationResult, ServerVersion};
use rodsclient_transport::{
    CallOptions, ConnectPhase, Connection, RequestResponsePair, ServerVerification, TransportError, PIPELINE_DEPTH,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::fake_server::{ServerConn, CAT_INVALID_AUTHENTICATION};
use crate::harness::{
    native_account, negotiating_account, test_config, InstrumentedStream, StreamDialer, TlsIdentity, TEST_PASSWORD,
};

fn ticket(n: usize) -> TicketAdminRequest {
    TicketAdminRequest {
        ticket: format!("ticket-{}", n),
    }
}

async fn bound(stream: rodsclient_transport::BoxedStream) -> Connection {
    let mut conn = Connection::new(native_account("localhost", 1247), test_config());
    conn.bind(stream, ServerVersion::new("rods4.3.2", "d")).await;
    conn
}

#[tokio::test]
async fn test_dont_care_client_upgrades_for_require_ssl_server() {
    rodsclient_transport::init_test_tracing();
    let identity = TlsIdentity::generate().unwrap();
    let acceptor = identity.acceptor();
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        assert!(server.expect_startup().await?);
        let result = server.offer_negotiation(NegotiationPolicy::RequireSsl).await?;
        assert_eq!(result, NegotiationResult::UseSsl);
        let params = server.expect_ssl_bootstrap(&acceptor).await?;
        server.send_version().await?;
        assert!(server.serve_native_login(TEST_PASSWORD).await?);
        server.expect_disconnect().await?;
        anyhow::Ok(params)
    });

    let account = negotiating_account("localhost", 1247, NegotiationPolicy::DontCare);
    let mut conn = Connection::new(account, test_config()).with_dialer(StreamDialer::new(vec![Box::new(client)]));
    conn.connect().await.unwrap();

    assert!(conn.is_connected());
    assert!(conn.is_tls());
    assert!(conn.is_logged_in());
    assert_eq!(conn.server_version().unwrap().release, "rods4.3.2");
    let secret = conn.shared_secret().unwrap().as_bytes().to_vec();

    conn.disconnect().await.unwrap();
    let params = server_task.await.unwrap().unwrap();
    assert_eq!(params.algorithm, "AES-256-CBC");
    assert_eq!(params.key_size, 32);
    assert_eq!(params.salt_size, 8);
    assert_eq!(params.hash_rounds, 16);
    assert_eq!(params.secret, secret);
    assert_eq!(conn.metrics().snapshot().tls_upgrades, 1);
}

#[tokio::test]
async fn test_tls_upgrade_over_loopback_verifies_hostname() {
    let identity = TlsIdentity::generate().unwrap();
    let ca_file = identity.ca_file().unwrap();
    let acceptor = identity.acceptor();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let mut server = ServerConn::new(Box::new(socket));
        server.expect_startup().await?;
        server.offer_negotiation(NegotiationPolicy::RequireSsl).await?;
        server.expect_ssl_bootstrap(&acceptor).await?;
        server.send_version().await?;
        let logged_in = server.serve_native_login(TEST_PASSWORD).await?;
        server.expect_disconnect().await?;
        anyhow::Ok(logged_in)
    });

    let mut account = negotiating_account("127.0.0.1", port, NegotiationPolicy::DontCare);
    if let Some(ssl) = account.ssl.as_mut() {
        ssl.verify_server = ServerVerification::Hostname;
        ssl.ca_certificate_file = Some(ca_file.path().to_path_buf());
        ssl.server_name = Some("localhost".to_string());
    }
    let mut conn = Connection::new(account, test_config());
    conn.connect().await.unwrap();
    assert!(conn.is_tls());
    assert!(conn.is_logged_in());

    conn.disconnect().await.unwrap();
    assert!(server_task.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_require_tcp_client_fails_against_require_ssl_server() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        server.expect_startup().await?;
        let result = server.offer_negotiation(NegotiationPolicy::RequireSsl).await?;
        let mut after = Vec::new();
        while let Ok(msg) = server.recv().await {
            after.push(msg.header.msg_type);
        }
        anyhow::Ok((result, after))
    });

    let account = negotiating_account("localhost", 1247, NegotiationPolicy::RequireTcp);
    let mut conn = Connection::new(account, test_config()).with_dialer(StreamDialer::new(vec![Box::new(client)]));
    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.phase(), Some(ConnectPhase::Negotiation));
    assert!(!conn.is_connected());
    assert!(!conn.is_logged_in());
    drop(conn);

    let (result, after) = server_task.await.unwrap().unwrap();
    assert_eq!(result, NegotiationResult::Failure);
    assert!(after.iter().all(|t| t != msg_type::API_REQ), "sent {:?}", after);
    assert_eq!(after, vec![msg_type::DISCONNECT.to_string()]);
}

#[tokio::test]
async fn test_wrong_password_is_refused_by_service() {
    let (client, server) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        assert!(!server.expect_startup().await?);
        server.send_version().await?;
        let logged_in = server.serve_native_login("not the password").await?;
        server.expect_disconnect().await?;
        anyhow::Ok(logged_in)
    });

    let mut conn = Connection::new(native_account("localhost", 1247), test_config())
        .with_dialer(StreamDialer::new(vec![Box::new(client)]));
    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.phase(), Some(ConnectPhase::Authentication));
    assert_eq!(err.service_code(), Some(CAT_INVALID_AUTHENTICATION));
    match &err {
        TransportError::Connect { source, .. } => {
            assert!(matches!(**source, TransportError::Auth { .. }), "got {:?}", source)
        }
        other => panic!("expected a connect error, got {:?}", other),
    }
    assert!(!conn.is_logged_in());
    assert!(!server_task.await.unwrap().unwrap());
    assert_eq!(conn.metrics().snapshot().connection_failures, 1);
}

#[tokio::test]
async fn test_oversized_message_len_is_a_short_read() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = bound(Box::new(client)).await;

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        server.recv().await?;
        let mut reply = Message::new(msg_type::API_REPLY, b"<short/>".to_vec(), 0);
        reply.header.message_len = 1 << 20;
        server.send_raw(&reply.encode()).await?;
        anyhow::Ok(())
    });

    let mut response = EmptyResponse::default();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        conn.request_sync(&ticket(1), &mut response, Duration::from_secs(5)),
    )
    .await
    .expect("short frame must not hang");
    server_task.await.unwrap().unwrap();

    match result {
        Err(TransportError::ShortRead { expected, actual }) => {
            assert_eq!(expected, 1 << 20);
            assert_eq!(actual, b"<short/>".len() as u64);
        }
        other => panic!("expected a short read, got {:?}", other),
    }
    assert!(conn.is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_frame_hits_the_deadline() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = bound(Box::new(client)).await;

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        server.recv().await?;
        let mut reply = Message::new(msg_type::API_REPLY, b"<short/>".to_vec(), 0);
        reply.header.message_len = 1 << 20;
        server.send_raw(&reply.encode()).await?;
        // keep the stream open so only the deadline ends the read
        anyhow::Ok(server)
    });

    let mut response = EmptyResponse::default();
    let err = conn
        .request_sync_with(&ticket(1), &mut response, CallOptions::with_timeout(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "got {:?}", err);
    assert!(conn.is_failed());
    let _server = server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_pipeline_third_send_failure_is_sticky() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let reads = Arc::new(AtomicUsize::new(0));
    let stream = InstrumentedStream::new(client, Arc::clone(&reads)).fail_writes_after(2);
    let conn = bound(Box::new(stream)).await;

    let server_task = tokio::spawn(async move {
        let mut server = ServerConn::new(Box::new(server));
        for n in 1..=2 {
            let request = server.recv().await?;
            assert_eq!(request.header.msg_type, msg_type::API_REQ);
            server
                .send(&Message::new(msg_type::API_REPLY, Vec::new(), n))
                .await?;
        }
        anyhow::Ok(server)
    });

    let (tx, rx) = mpsc::channel(PIPELINE_DEPTH);
    let mut out = conn.request_pipelined(rx);
    for n in 1..=5 {
        tx.send(RequestResponsePair::new(ticket(n), EmptyResponse::default()))
            .await
            .unwrap();
    }
    drop(tx);

    let mut results = Vec::new();
    for _ in 0..2 {
        results.push(out.recv().await.unwrap());
    }
    let reads_before_failures = reads.load(Ordering::SeqCst);
    while let Some(pair) = out.recv().await {
        results.push(pair);
    }
    let _server = server_task.await.unwrap().unwrap();

    assert_eq!(results.len(), 5);
    for (i, pair) in results[..2].iter().enumerate() {
        assert!(pair.error.is_none());
        assert_eq!(pair.response.result, i as i32 + 1);
    }
    let sticky = results[2].error.clone().unwrap();
    assert!(sticky.is_transport_failure());
    for pair in &results[2..] {
        assert!(Arc::ptr_eq(pair.error.as_ref().unwrap(), &sticky));
        assert_eq!(pair.response.result, 0);
    }
    assert_eq!(reads.load(Ordering::SeqCst), reads_before_failures);
    assert!(conn.is_failed());
    assert_eq!(conn.metrics().snapshot().requests_sent, 2);
}
