//! Control-byte framing for the terminal stream.
//!
//! Inbound messages are either raw keystrokes or, when the first byte is
//! [`CONTROL_MARKER`], a short ASCII command:
//!
//! ```text
//! 0x01 "PING"            keepalive
//! 0x01 "SIZE <cols> <rows>"  resize
//! 0x01 "PLAY"            restart playback (replay endpoint)
//! 0x01 "FRAME <n>"       render one recorded frame (replay endpoint)
//! ```
//!
//! Outbound there is no envelope: terminal bytes go out as binary messages and
//! status lines as plain text.

/// First byte of every control message.
pub const CONTROL_MARKER: u8 = 0x01;

/// Status line sent to the client when the shell exits.
pub const SESSION_ENDED: &str = "session ended";

/// Status line sent when a session cannot be started.
pub const SESSION_FAILED: &str = "Failed to start session";

/// Bytes trimmed from both ends of a control payload.
const PAYLOAD_TRIM: &[u8] = b" \n\r\t\x00\x01";

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Nothing left after stripping padding.
    Empty,
    /// Raw terminal input, written verbatim to the PTY.
    Data(&'a [u8]),
    /// A control command.
    Control(Control),
}

/// A control command carried after the marker byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Ping,
    Resize { cols: u16, rows: u16 },
    Play,
    Frame(usize),
    /// A recognised command whose arguments did not parse.
    Invalid { payload: String, reason: String },
    /// Anything else.
    Unknown(String),
}

/// Decode one inbound message.
pub fn decode(msg: &[u8]) -> Inbound<'_> {
    let end = msg.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let msg = &msg[..end];

    match msg.split_first() {
        None => Inbound::Empty,
        Some((&CONTROL_MARKER, rest)) => Inbound::Control(parse_control(trim(rest))),
        Some(_) => Inbound::Data(msg),
    }
}

fn trim(mut payload: &[u8]) -> &[u8] {
    while let Some((first, rest)) = payload.split_first() {
        if !PAYLOAD_TRIM.contains(first) {
            break;
        }
        payload = rest;
    }
    while let Some((last, rest)) = payload.split_last() {
        if !PAYLOAD_TRIM.contains(last) {
            break;
        }
        payload = rest;
    }
    payload
}

fn parse_control(payload: &[u8]) -> Control {
    let payload = String::from_utf8_lossy(payload).into_owned();
    let fields: Vec<&str> = payload.split_whitespace().collect();

    match fields.first().copied() {
        Some("PING") if fields.len() == 1 => Control::Ping,
        Some("PLAY") if fields.len() == 1 => Control::Play,
        Some("SIZE") => parse_size(&fields).unwrap_or_else(|reason| Control::Invalid {
            payload: payload.clone(),
            reason,
        }),
        Some("FRAME") => parse_frame(&fields).unwrap_or_else(|reason| Control::Invalid {
            payload: payload.clone(),
            reason,
        }),
        _ => Control::Unknown(payload),
    }
}

fn parse_size(fields: &[&str]) -> Result<Control, String> {
    if fields.len() != 3 {
        return Err(format!("expected SIZE <cols> <rows>, got {} fields", fields.len()));
    }
    let cols = fields[1]
        .parse::<u16>()
        .map_err(|e| format!("bad column count {:?}: {e}", fields[1]))?;
    let rows = fields[2]
        .parse::<u16>()
        .map_err(|e| format!("bad row count {:?}: {e}", fields[2]))?;
    Ok(Control::Resize { cols, rows })
}

fn parse_frame(fields: &[&str]) -> Result<Control, String> {
    if fields.len() != 2 {
        return Err(format!("expected FRAME <index>, got {} fields", fields.len()));
    }
    fields[1]
        .parse::<usize>()
        .map(Control::Frame)
        .map_err(|e| format!("bad frame index {:?}: {e}", fields[1]))
}
