/// Address discovery
///
/// Envelope roles come straight off the transaction; participants are
/// addresses found anywhere inside event payloads. Payload walking is
/// iterative with an explicit stack so a pathological payload cannot blow
/// the call stack; depth is capped.

use std::collections::HashSet;

use serde_json::Value;

use crate::sanitize::normalize_address;
use crate::types::{AddressActivity, AddressRole, EventRecord, TxRecord};

/// Nesting depth past which payload values are ignored.
const MAX_WALK_DEPTH: usize = 64;

/// True for an 8-byte address rendered as hex, with or without 0x.
pub fn looks_like_address(s: &str) -> bool {
    let hex_part = s.strip_prefix("0x").unwrap_or(s);
    hex_part.len() == 16 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// Collect every address-shaped string in a payload tree, normalized to
/// lowercase hex without prefix.
pub fn addresses_in_payload(payload: &Value) -> HashSet<String> {
    let mut found = HashSet::new();
    let mut stack: Vec<(&Value, usize)> = vec![(payload, 0)];

    while let Some((value, depth)) = stack.pop() {
        if depth > MAX_WALK_DEPTH {
            continue;
        }
        match value {
            Value::String(s) => {
                if looks_like_address(s) {
                    found.insert(normalize_address(s));
                }
            }
            Value::Array(items) => {
                for item in items {
                    stack.push((item, depth + 1));
                }
            }
            Value::Object(map) => {
                for (_, item) in map {
                    stack.push((item, depth + 1));
                }
            }
            _ => {}
        }
    }
    found
}

/// Field accessor for JSON-CDC payloads. Handles both the nested
/// { value: { fields: [{ name, value: { value } }] } } encoding and plain
/// objects.
pub fn cadence_field<'a>(payload: &'a Value, name: &str) -> Option<&'a Value> {
    if let Some(direct) = payload.get(name) {
        return Some(unwrap_cadence(direct));
    }
    let fields = payload.get("value")?.get("fields")?.as_array()?;
    fields
        .iter()
        .find(|f| f.get("name").and_then(|n| n.as_str()) == Some(name))
        .and_then(|f| f.get("value"))
        .map(unwrap_cadence)
}

/// Peel the { type, value } wrapper JSON-CDC puts around scalars.
fn unwrap_cadence(value: &Value) -> &Value {
    match value.get("value") {
        Some(inner) if value.get("type").is_some() => inner,
        _ => value,
    }
}

/// The union of envelope roles and payload participants for one
/// transaction, each tagged with its role.
pub fn derive_address_activity(tx: &TxRecord, events: &[EventRecord]) -> Vec<AddressActivity> {
    let mut seen = HashSet::new();
    let mut activity = Vec::new();

    let mut push = |address: String, role: AddressRole, activity: &mut Vec<AddressActivity>| {
        if address.is_empty() {
            return;
        }
        if seen.insert((address.clone(), role)) {
            activity.push(AddressActivity {
                address,
                block_height: tx.block_height,
                transaction_id: tx.id.clone(),
                role,
            });
        }
    };

    push(normalize_address(&tx.proposer), AddressRole::Proposer, &mut activity);
    push(normalize_address(&tx.payer), AddressRole::Payer, &mut activity);
    for authorizer in &tx.authorizers {
        push(normalize_address(authorizer), AddressRole::Authorizer, &mut activity);
    }

    for event in events.iter().filter(|e| e.transaction_id == tx.id) {
        if let Some(payload) = &event.payload {
            for address in addresses_in_payload(payload) {
                push(address, AddressRole::Participant, &mut activity);
            }
        }
    }

    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(proposer: &str, payer: &str, authorizers: &[&str]) -> TxRecord {
        TxRecord {
            id: "aa".repeat(16),
            block_height: 7,
            tx_index: 0,
            script_hash: "00".repeat(32),
            script_inline: None,
            arguments: json!([]),
            proposer: proposer.to_string(),
            proposer_key_index: 0,
            proposer_sequence: 0,
            payer: payer.to_string(),
            authorizers: authorizers.iter().map(|s| s.to_string()).collect(),
            payload_signatures: json!([]),
            envelope_signatures: json!([]),
            gas_limit: 100,
            gas_used: 10,
            status: "SEALED".to_string(),
            error_message: None,
            is_evm: false,
            events_count: 0,
        }
    }

    #[test]
    fn test_looks_like_address() {
        assert!(looks_like_address("0x1654653399040a61"));
        assert!(looks_like_address("1654653399040a61"));
        assert!(!looks_like_address("0x1654"));
        assert!(!looks_like_address("not-an-address!!"));
        // 32 bytes is a hash, not an address
        assert!(!looks_like_address(&"ab".repeat(32)));
    }

    #[test]
    fn test_addresses_in_payload_nested() {
        let payload = json!({
            "value": {
                "fields": [
                    {"name": "from", "value": {"type": "Address", "value": "0x1654653399040a61"}},
                    {"name": "to", "value": {"type": "Address", "value": "0xf919ee77447b7497"}},
                    {"name": "note", "value": {"type": "String", "value": "hello"}}
                ]
            }
        });
        let found = addresses_in_payload(&payload);
        assert_eq!(found.len(), 2);
        assert!(found.contains("1654653399040a61"));
        assert!(found.contains("f919ee77447b7497"));
    }

    #[test]
    fn test_walk_depth_is_capped() {
        // Build a chain deeper than the cap with an address at the bottom.
        let mut payload = json!("0x1654653399040a61");
        for _ in 0..(MAX_WALK_DEPTH + 10) {
            payload = json!({ "inner": payload });
        }
        assert!(addresses_in_payload(&payload).is_empty());
    }

    #[test]
    fn test_cadence_field() {
        let payload = json!({
            "value": {
                "fields": [
                    {"name": "hash", "value": {"type": "String", "value": "deadbeef"}}
                ]
            }
        });
        assert_eq!(cadence_field(&payload, "hash").unwrap(), "deadbeef");
        assert!(cadence_field(&payload, "missing").is_none());

        // Plain object form
        let plain = json!({"hash": "cafebabe"});
        assert_eq!(cadence_field(&plain, "hash").unwrap(), "cafebabe");
    }

    #[test]
    fn test_derive_address_activity_roles() {
        let t = tx(
            "0x1654653399040a61",
            "0xf919ee77447b7497",
            &["0xe467b9dd11fa00df"],
        );
        let events = vec![EventRecord {
            block_height: 7,
            transaction_id: t.id.clone(),
            event_index: 0,
            transaction_index: 0,
            event_type: "A.1654653399040a61.FlowToken.TokensDeposited".to_string(),
            payload: Some(json!({"value": {"fields": [
                {"name": "to", "value": {"type": "Address", "value": "0x97bcb43aa1d62ce4"}}
            ]}})),
            payload_hash: String::new(),
            payload_ref: None,
        }];

        let activity = derive_address_activity(&t, &events);
        let roles: Vec<(String, AddressRole)> = activity
            .iter()
            .map(|a| (a.address.clone(), a.role))
            .collect();

        assert!(roles.contains(&("1654653399040a61".to_string(), AddressRole::Proposer)));
        assert!(roles.contains(&("f919ee77447b7497".to_string(), AddressRole::Payer)));
        assert!(roles.contains(&("e467b9dd11fa00df".to_string(), AddressRole::Authorizer)));
        assert!(roles.contains(&("97bcb43aa1d62ce4".to_string(), AddressRole::Participant)));
    }

    #[test]
    fn test_activity_is_deduplicated_per_role() {
        let t = tx("0x1654653399040a61", "0x1654653399040a61", &[]);
        let activity = derive_address_activity(&t, &[]);
        // Same address, two roles: two rows, not one, not three.
        assert_eq!(activity.len(), 2);
    }
}
