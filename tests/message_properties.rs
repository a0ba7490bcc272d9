//! Property-based tests for the SIWA message codec.

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use proptest::prelude::*;

use siwa::{AgentId, AgentRegistry, SiwaMessage};

fn arb_domain() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,16}(\\.[a-z0-9-]{1,10}){0,3}(:[0-9]{1,5})?"
}

fn arb_address() -> impl Strategy<Value = String> {
    "0x[0-9a-fA-F]{40}"
}

fn arb_statement() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::collection::vec("[^\n]{1,40}", 1..4).prop_map(|lines| lines.join("\n")))
}

fn arb_uri() -> impl Strategy<Value = String> {
    "https://[a-z]{1,12}\\.example(/[a-z0-9_-]{1,8}){0,3}"
}

fn arb_agent_id() -> impl Strategy<Value = AgentId> {
    prop_oneof![
        any::<u64>().prop_map(AgentId::from),
        any::<[u8; 32]>().prop_map(|bytes| AgentId::new(U256::from_be_bytes(bytes))),
        Just(AgentId::new(U256::MAX)),
    ]
}

fn arb_registry() -> impl Strategy<Value = AgentRegistry> {
    (any::<u64>(), arb_address()).prop_map(|(chain_id, address)| AgentRegistry::new(chain_id, address))
}

fn arb_nonce() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{8,40}"
}

/// 2000-01-01 through 2099-12-31 with nanosecond precision.
fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (946_684_800i64..4_102_444_800i64, 0u32..1_000_000_000u32).prop_map(|(secs, nanos)| {
        DateTime::<Utc>::from_timestamp(secs, nanos).expect("timestamp in range")
    })
}

fn arb_request_id() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[A-Za-z0-9._:-]{1,30}")
}

fn arb_message() -> impl Strategy<Value = SiwaMessage> {
    (
        (arb_domain(), arb_address(), arb_statement(), arb_uri()),
        (arb_agent_id(), arb_registry(), arb_nonce()),
        (
            arb_timestamp(),
            prop::option::of(arb_timestamp()),
            prop::option::of(arb_timestamp()),
            arb_request_id(),
        ),
    )
        .prop_map(
            |(
                (domain, address, statement, uri),
                (agent_id, registry, nonce),
                (issued_at, expiration_time, not_before, request_id),
            )| {
                let mut message =
                    SiwaMessage::new(domain, address, uri, agent_id, registry, nonce, issued_at);
                message.statement = statement;
                message.expiration_time = expiration_time;
                message.not_before = not_before;
                message.request_id = request_id;
                message
            },
        )
}

proptest! {
    #[test]
    fn generated_messages_are_valid(message in arb_message()) {
        prop_assert!(message.validate().is_ok(), "{:?}", message.validate());
    }

    #[test]
    fn decode_inverts_encode(message in arb_message()) {
        let text = message.encode();
        let decoded = SiwaMessage::parse(&text);
        prop_assert_eq!(decoded, Ok(message));
    }

    #[test]
    fn agent_id_decimal_roundtrip(id in arb_agent_id()) {
        prop_assert_eq!(AgentId::parse(&id.to_string()), Ok(id));
    }
}
