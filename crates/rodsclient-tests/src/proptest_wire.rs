//! Property tests for framing, negotiation and the auth context.

use proptest::prelude::*;
use rodsclient_proto::frame::msg_type;
use rodsclient_proto::negotiation::resolve;
use rodsclient_proto::{Message, NegotiationPolicy, NegotiationResult};
use rodsclient_transport::framer::read_message;
use rodsclient_transport::{AuthContext, TransportError};
use serde_json::{Map, Value};

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(fut)
}

fn policy() -> impl Strategy<Value = NegotiationPolicy> {
    prop::sample::select(NegotiationPolicy::ALL.to_vec())
}

fn frame() -> impl Strategy<Value = Message> {
    (
        prop::collection::vec(any::<u8>(), 0..256),
        prop::collection::vec(any::<u8>(), 0..256),
        any::<i32>(),
    )
        .prop_map(|(body, bs, int_info)| Message::new(msg_type::API_REPLY, body, int_info).with_bs(bs))
}

proptest! {
    #[test]
    fn prop_truncated_frame_is_an_error(msg in frame(), cut in any::<prop::sample::Index>()) {
        let wire = msg.encode();
        let cut = cut.index(wire.len());
        let mut truncated = &wire[..cut];
        let result = block_on(read_message(&mut truncated, None, None));
        prop_assert!(result.is_err());
        prop_assert!(
            !matches!(result, Err(TransportError::Io(_))),
            "truncation surfaced as a raw I/O error"
        );
    }

    #[test]
    fn prop_complete_frame_reads_exactly_its_bytes(msg in frame(), trailing in prop::collection::vec(any::<u8>(), 0..32)) {
        let mut wire = msg.encode();
        let frame_len = wire.len() as u64;
        wire.extend_from_slice(&trailing);
        let mut input = &wire[..];
        let (read, total) = block_on(read_message(&mut input, None, None)).unwrap();
        prop_assert_eq!(total, frame_len);
        prop_assert_eq!(input.len(), trailing.len());
        prop_assert_eq!(read.header.int_info, msg.header.int_info);
    }

    #[test]
    fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut input = &bytes[..];
        let _ = block_on(read_message(&mut input, None, None));
    }

    #[test]
    fn prop_negotiation_is_symmetric(client in policy(), server in policy()) {
        prop_assert_eq!(resolve(client, server), resolve(server, client));
    }

    #[test]
    fn prop_negotiation_fails_only_on_conflict(client in policy(), server in policy()) {
        let conflict = matches!(
            (client, server),
            (NegotiationPolicy::RequireSsl, NegotiationPolicy::RequireTcp)
                | (NegotiationPolicy::RequireTcp, NegotiationPolicy::RequireSsl)
        );
        prop_assert_eq!(resolve(client, server) == NegotiationResult::Failure, conflict);
    }

    #[test]
    fn prop_auth_context_keeps_unknown_keys(
        extra in prop::collection::btree_map("x_[a-z]{1,8}", "[ -~]{0,16}", 0..8),
        operation in "[a-z_]{1,24}",
    ) {
        let mut wire: Map<String, Value> = extra
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        wire.insert("next_operation".into(), Value::String(operation.clone()));

        let sent = AuthContext::with_password("secret");
        let ctx = AuthContext::from_wire(wire.clone(), &sent).unwrap();
        prop_assert_eq!(ctx.next_operation(), Some(operation.as_str()));
        prop_assert_eq!(ctx.password.as_deref(), Some("secret"));
        prop_assert_eq!(ctx.extra.len(), extra.len());

        let back = ctx.to_wire().unwrap();
        prop_assert!(!back.contains_key("password"));
        prop_assert_eq!(back, wire);
    }
}
