//! MySQL client packet decoding.

use super::{read_cstr, Dump, SessionValues};

const HEADER_LEN: usize = 4;

const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

/// Capability flags, max packet size, charset and 23 filler bytes.
const HANDSHAKE_FIXED_LEN: usize = 32;

const COM_INIT_DB: u8 = 0x02;
const COM_QUERY: u8 = 0x03;
const COM_STMT_PREPARE: u8 = 0x16;

pub(super) fn inspect_client(data: &[u8], session: &mut SessionValues) -> Vec<Dump> {
    let mut dumps = Vec::new();
    let mut pos = 0;

    while pos + HEADER_LEN <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], 0]) as usize;
        let seq = data[pos + 3];
        let start = pos + HEADER_LEN;
        let end = start + len;
        if end > data.len() {
            break;
        }
        let payload = &data[start..end];
        pos = end;

        if seq == 0 {
            inspect_command(payload, session, &mut dumps);
        } else {
            read_handshake_response(payload, session);
        }
    }

    dumps
}

fn inspect_command(payload: &[u8], session: &mut SessionValues, dumps: &mut Vec<Dump>) {
    let Some((&command, rest)) = payload.split_first() else {
        return;
    };
    let text = || String::from_utf8_lossy(rest).into_owned();
    match command {
        COM_QUERY | COM_STMT_PREPARE => dumps.push(Dump::Query(text())),
        COM_INIT_DB => session.database = Some(text()),
        _ => {}
    }
}

/// Decode a HandshakeResponse41. An SSL request has the same prefix but stops
/// after the fixed part, so it never reaches the username.
fn read_handshake_response(payload: &[u8], session: &mut SessionValues) {
    if payload.len() <= HANDSHAKE_FIXED_LEN {
        return;
    }
    let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if caps & CLIENT_PROTOCOL_41 == 0 {
        return;
    }

    let Some((username, mut pos)) = read_cstr(payload, HANDSHAKE_FIXED_LEN) else {
        return;
    };
    session.username = Some(username);

    if caps & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let Some((auth_len, next)) = read_lenenc(payload, pos) else {
            return;
        };
        pos = next.saturating_add(auth_len);
    } else if caps & CLIENT_SECURE_CONNECTION != 0 {
        let Some(&auth_len) = payload.get(pos) else {
            return;
        };
        pos += 1 + auth_len as usize;
    } else {
        let Some((_, next)) = read_cstr(payload, pos) else {
            return;
        };
        pos = next;
    }

    if caps & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some((database, _)) = read_cstr(payload, pos) {
            if !database.is_empty() {
                session.database = Some(database);
            }
        }
    }
}

/// Length-encoded integer.
fn read_lenenc(data: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *data.get(pos)?;
    let width = match first {
        0x00..=0xfa => return Some((first as usize, pos + 1)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return None,
    };
    let bytes = data.get(pos + 1..pos + 1 + width)?;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(bytes);
    let value = usize::try_from(u64::from_le_bytes(buf)).ok()?;
    Some((value, pos + 1 + width))
}
