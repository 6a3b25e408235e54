use super::*;
use bytes::{BufMut, BytesMut};
use nom::{
    bytes::complete::{tag, take_until},
    combinator::map,
    multi::many0,
    number::complete::{be_u16, be_u32, be_u8},
    sequence::terminated,
    IResult, Parser,
};

pub const SMFIC_ABORT: u8 = b'A';
pub const SMFIC_BODY: u8 = b'B';
pub const SMFIC_CONNECT: u8 = b'C';
pub const SMFIC_MACRO: u8 = b'D';
pub const SMFIC_BODYEOB: u8 = b'E';
pub const SMFIC_HELO: u8 = b'H';
pub const SMFIC_QUIT_NC: u8 = b'K';
pub const SMFIC_HEADER: u8 = b'L';
pub const SMFIC_MAIL: u8 = b'M';
pub const SMFIC_EOH: u8 = b'N';
pub const SMFIC_OPTNEG: u8 = b'O';
pub const SMFIC_QUIT: u8 = b'Q';
pub const SMFIC_RCPT: u8 = b'R';
pub const SMFIC_DATA: u8 = b'T';
pub const SMFIC_UNKNOWN: u8 = b'U';

pub const SMFIR_ACCEPT: u8 = b'a';
pub const SMFIR_CONTINUE: u8 = b'c';
pub const SMFIR_DISCARD: u8 = b'd';
pub const SMFIR_ADDHEADER: u8 = b'h';
pub const SMFIR_CHGHEADER: u8 = b'm';
pub const SMFIR_QUARANTINE: u8 = b'q';
pub const SMFIR_REJECT: u8 = b'r';
pub const SMFIR_TEMPFAIL: u8 = b't';
pub const SMFIR_REPLYCODE: u8 = b'y';

/// Connection family sent when the MTA does not know the client address.
const SMFIA_UNKNOWN: u8 = b'U';

/// Commands the MTA sends to a filter.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Protocol version and the action/protocol masks the MTA supports
    OptionNegotiation(Options),
    /// Macro definitions for the stage named by `stage`
    Macro {
        stage: u8,
        macros: Vec<(String, String)>,
    },
    Connect(ConnectInfo),
    Helo(String),
    /// MAIL FROM with optional ESMTP arguments
    MailFrom { sender: String, args: Vec<String> },
    /// RCPT TO with optional ESMTP arguments
    Rcpt { recipient: String, args: Vec<String> },
    Data,
    Header { name: String, value: String },
    EndOfHeaders,
    Body(Vec<u8>),
    EndOfBody,
    /// SMTP command the MTA did not recognize
    Unknown(String),
    Abort,
    Quit,
    QuitNewConnection,
}

/// Parses one packet (command byte plus payload, length prefix stripped).
pub(crate) fn parse_command(frame: &[u8]) -> Result<Command, MilterError> {
    let Some((&code, payload)) = frame.split_first() else {
        return Err(MilterError::ParseError {
            message: "empty packet".to_string(),
            span: (0, 0).into(),
        });
    };

    let parse_result: IResult<&[u8], Command> = match code {
        SMFIC_OPTNEG => parse_option_negotiation(payload),
        SMFIC_MACRO => parse_macro(payload),
        SMFIC_CONNECT => parse_connect(payload),
        SMFIC_HELO => map(cstring, Command::Helo).parse(payload),
        SMFIC_MAIL => parse_mail_from(payload),
        SMFIC_RCPT => parse_rcpt(payload),
        SMFIC_HEADER => parse_header(payload),
        SMFIC_UNKNOWN => map(cstring, Command::Unknown).parse(payload),
        SMFIC_BODY => Ok((&[][..], Command::Body(payload.to_vec()))),
        SMFIC_DATA => Ok((payload, Command::Data)),
        SMFIC_EOH => Ok((payload, Command::EndOfHeaders)),
        SMFIC_BODYEOB => Ok((payload, Command::EndOfBody)),
        SMFIC_ABORT => Ok((payload, Command::Abort)),
        SMFIC_QUIT => Ok((payload, Command::Quit)),
        SMFIC_QUIT_NC => Ok((payload, Command::QuitNewConnection)),
        other => return Err(MilterError::UnknownCommand(other as char)),
    };

    parse_result
        .map(|(_, cmd)| cmd)
        .map_err(|e| MilterError::ParseError {
            message: format!("command {:?}: {}", code as char, e),
            span: (0, frame.len()).into(),
        })
}

/// NUL terminated string, decoded lossily.
fn cstring(input: &[u8]) -> IResult<&[u8], String> {
    map(
        terminated(take_until(&b"\0"[..]), tag(&b"\0"[..])),
        |s: &[u8]| String::from_utf8_lossy(s).into_owned(),
    )
    .parse(input)
}

fn parse_option_negotiation(input: &[u8]) -> IResult<&[u8], Command> {
    map((be_u32, be_u32, be_u32), |(version, actions, protocol)| {
        Command::OptionNegotiation(Options {
            version,
            actions,
            protocol,
        })
    })
    .parse(input)
}

fn parse_macro(input: &[u8]) -> IResult<&[u8], Command> {
    map((be_u8, many0((cstring, cstring))), |(stage, macros)| {
        Command::Macro { stage, macros }
    })
    .parse(input)
}

fn parse_connect(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, (hostname, family)) = (cstring, be_u8).parse(input)?;
    if family == SMFIA_UNKNOWN {
        return Ok((
            input,
            Command::Connect(ConnectInfo {
                hostname,
                family,
                port: None,
                address: None,
            }),
        ));
    }
    let (input, (port, address)) = (be_u16, cstring).parse(input)?;
    Ok((
        input,
        Command::Connect(ConnectInfo {
            hostname,
            family,
            port: Some(port),
            address: Some(address),
        }),
    ))
}

fn parse_mail_from(input: &[u8]) -> IResult<&[u8], Command> {
    map((cstring, many0(cstring)), |(sender, args)| {
        Command::MailFrom { sender, args }
    })
    .parse(input)
}

fn parse_rcpt(input: &[u8]) -> IResult<&[u8], Command> {
    map((cstring, many0(cstring)), |(recipient, args)| Command::Rcpt {
        recipient,
        args,
    })
    .parse(input)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], Command> {
    map((cstring, cstring), |(name, value)| Command::Header { name, value }).parse(input)
}

fn packet(code: u8, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload_len + 5);
    buf.put_u32(payload_len as u32 + 1);
    buf.put_u8(code);
    buf
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn encode_options(options: &Options) -> BytesMut {
    let mut buf = packet(SMFIC_OPTNEG, 12);
    buf.put_u32(options.version);
    buf.put_u32(options.actions);
    buf.put_u32(options.protocol);
    buf
}

pub(crate) fn encode_response(response: &Response) -> BytesMut {
    match response {
        Response::Continue => packet(SMFIR_CONTINUE, 0),
        Response::Accept => packet(SMFIR_ACCEPT, 0),
        Response::Reject => packet(SMFIR_REJECT, 0),
        Response::TempFail => packet(SMFIR_TEMPFAIL, 0),
        Response::Discard => packet(SMFIR_DISCARD, 0),
        Response::ReplyCode { code, text } => {
            let line = format!("{code} {text}");
            let mut buf = packet(SMFIR_REPLYCODE, line.len() + 1);
            put_cstring(&mut buf, &line);
            buf
        }
    }
}

pub(crate) fn encode_modification(modification: &Modification) -> BytesMut {
    match modification {
        Modification::AddHeader { name, value } => {
            let mut buf = packet(SMFIR_ADDHEADER, name.len() + value.len() + 2);
            put_cstring(&mut buf, name);
            put_cstring(&mut buf, value);
            buf
        }
        Modification::ChangeHeader { index, name, value } => {
            let mut buf = packet(SMFIR_CHGHEADER, 4 + name.len() + value.len() + 2);
            buf.put_u32(*index);
            put_cstring(&mut buf, name);
            put_cstring(&mut buf, value);
            buf
        }
        Modification::Quarantine { reason } => {
            let mut buf = packet(SMFIR_QUARANTINE, reason.len() + 1);
            put_cstring(&mut buf, reason);
            buf
        }
    }
}
