//! PostgreSQL frontend message decoding.
//!
//! Only complete messages inside a chunk are decoded; a message split across
//! reads is skipped.

use super::{read_cstr, Dump, SessionValues};

const PROTOCOL_V3: u32 = 196_608;
#[cfg(test)]
const SSL_REQUEST: u32 = 80_877_103;

const MSG_QUERY: u8 = b'Q';
const MSG_PARSE: u8 = b'P';

pub(super) fn inspect_frontend(data: &[u8], session: &mut SessionValues) -> Vec<Dump> {
    let mut dumps = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        // Untyped messages (startup family) begin with the high byte of their
        // length, which is always zero in practice.
        if data[pos] == 0 {
            let Some(len) = read_u32(data, pos) else {
                break;
            };
            let Some(end) = message_end(data, pos, len).filter(|end| *end >= pos + 8) else {
                break;
            };
            // SSL, GSS and cancel requests carry nothing worth recording.
            if read_u32(data, pos + 4) == Some(PROTOCOL_V3) {
                read_startup_params(&data[pos + 8..end], session);
            }
            pos = end;
            continue;
        }

        let kind = data[pos];
        let Some(len) = read_u32(data, pos + 1) else {
            break;
        };
        let Some(end) = message_end(data, pos + 1, len) else {
            break;
        };
        let body = &data[pos + 5..end];

        match kind {
            MSG_QUERY => {
                if let Some((query, _)) = read_cstr(body, 0) {
                    dumps.push(Dump::Query(query));
                }
            }
            MSG_PARSE => {
                if let Some((_statement, next)) = read_cstr(body, 0) {
                    if let Some((query, _)) = read_cstr(body, next) {
                        dumps.push(Dump::Query(query));
                    }
                }
            }
            _ => {}
        }
        pos = end;
    }

    dumps
}

fn read_startup_params(params: &[u8], session: &mut SessionValues) {
    let mut pos = 0;
    while let Some((key, next)) = read_cstr(params, pos) {
        if key.is_empty() {
            break;
        }
        let Some((value, after)) = read_cstr(params, next) else {
            break;
        };
        match key.as_str() {
            "user" => session.username = Some(value),
            "database" => session.database = Some(value),
            _ => {}
        }
        pos = after;
    }
}

fn read_u32(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// End offset of a message whose length field (which counts itself) starts at
/// `len_pos`, if the whole message is present.
fn message_end(data: &[u8], len_pos: usize, len: u32) -> Option<usize> {
    let len = usize::try_from(len).ok()?;
    if len < 4 {
        return None;
    }
    let end = len_pos.checked_add(len)?;
    (end <= data.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![kind];
        msg.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        msg.extend_from_slice(body);
        msg
    }

    fn startup(params: &[(&str, &str)]) -> Vec<u8> {
        let mut body = PROTOCOL_V3.to_be_bytes().to_vec();
        for (k, v) in params {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);
        let mut msg = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn test_startup_message_sets_session() {
        let mut session = SessionValues::default();
        let dumps = inspect_frontend(
            &startup(&[("user", "alice"), ("database", "shop"), ("client_encoding", "UTF8")]),
            &mut session,
        );
        assert!(dumps.is_empty());
        assert_eq!(session.username.as_deref(), Some("alice"));
        assert_eq!(session.database.as_deref(), Some("shop"));
    }

    #[test]
    fn test_ssl_request_is_ignored() {
        let mut session = SessionValues::default();
        let mut msg = 8u32.to_be_bytes().to_vec();
        msg.extend_from_slice(&SSL_REQUEST.to_be_bytes());
        assert!(inspect_frontend(&msg, &mut session).is_empty());
        assert_eq!(session, SessionValues::default());
    }

    #[test]
    fn test_simple_query() {
        let mut session = SessionValues::default();
        let dumps = inspect_frontend(&typed(MSG_QUERY, b"SELECT 1;\0"), &mut session);
        assert_eq!(dumps, vec![Dump::Query("SELECT 1;".to_string())]);
    }

    #[test]
    fn test_parse_then_sync_in_one_chunk() {
        let mut session = SessionValues::default();
        let mut chunk = typed(MSG_PARSE, b"stmt1\0SELECT * FROM users WHERE id = $1\0\0\0");
        chunk.extend(typed(b'S', b""));
        chunk.extend(typed(MSG_QUERY, b"COMMIT\0"));
        let dumps = inspect_frontend(&chunk, &mut session);
        assert_eq!(
            dumps,
            vec![
                Dump::Query("SELECT * FROM users WHERE id = $1".to_string()),
                Dump::Query("COMMIT".to_string()),
            ]
        );
    }

    #[test]
    fn test_truncated_message_is_skipped() {
        let mut session = SessionValues::default();
        let msg = typed(MSG_QUERY, b"SELECT 1;\0");
        assert!(inspect_frontend(&msg[..msg.len() - 3], &mut session).is_empty());
    }
}
