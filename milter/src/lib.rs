use async_trait::async_trait;
use miette::{Diagnostic, IntoDiagnostic, Result, SourceSpan};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

mod parser;
pub use parser::*;

/// Highest protocol version this library speaks.
pub const MILTER_VERSION: u32 = 6;

/// Upper bound for a single packet. Postfix never sends body chunks above 64KiB.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Action flags a filter requests during option negotiation (SMFIF_*).
pub mod actions {
    pub const ADD_HEADERS: u32 = 0x01;
    pub const CHANGE_BODY: u32 = 0x02;
    pub const ADD_RCPT: u32 = 0x04;
    pub const DELETE_RCPT: u32 = 0x08;
    pub const CHANGE_HEADERS: u32 = 0x10;
    pub const QUARANTINE: u32 = 0x20;
}

/// Protocol flags asking the MTA to skip stages (SMFIP_*).
pub mod protocol {
    pub const NO_CONNECT: u32 = 0x01;
    pub const NO_HELO: u32 = 0x02;
    pub const NO_MAIL: u32 = 0x04;
    pub const NO_RCPT: u32 = 0x08;
    pub const NO_BODY: u32 = 0x10;
    pub const NO_HEADERS: u32 = 0x20;
    pub const NO_EOH: u32 = 0x40;
    pub const NO_UNKNOWN: u32 = 0x100;
    pub const NO_DATA: u32 = 0x200;
}

#[derive(Debug, Error, Diagnostic)]
pub enum MilterError {
    #[error("IO error")]
    #[diagnostic(code(milter::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    #[diagnostic(code(milter::parse_error))]
    ParseError {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },

    #[error("Unknown command {0:?}")]
    #[diagnostic(code(milter::unknown_command))]
    UnknownCommand(char),

    #[error("Packet of {0} bytes is out of bounds")]
    #[diagnostic(code(milter::frame_size))]
    FrameSize(usize),

    #[error("Filter error: {message}")]
    #[diagnostic(code(milter::callback_error))]
    CallbackError { message: String },
}

/// Negotiated protocol options, as exchanged in the `O` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub version: u32,
    pub actions: u32,
    pub protocol: u32,
}

impl Options {
    /// Narrows what the filter wants down to what the MTA offered.
    pub fn negotiate(&self, offered: &Options) -> Options {
        Options {
            version: self.version.min(offered.version),
            actions: self.actions & offered.actions,
            protocol: self.protocol & offered.protocol,
        }
    }
}

/// Connection details sent with the `C` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectInfo {
    pub hostname: String,
    /// `4`, `6`, `L` (unix socket) or `U` (unknown).
    pub family: u8,
    pub port: Option<u16>,
    pub address: Option<String>,
}

/// Final or intermediate reply to a milter command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Continue,
    Accept,
    Reject,
    TempFail,
    Discard,
    ReplyCode { code: u16, text: String },
}

impl Response {
    pub fn reply(code: u16, text: impl Into<String>) -> Self {
        Response::ReplyCode {
            code,
            text: text.into(),
        }
    }

    /// Whether the MTA stops sending commands for the current message.
    pub fn is_final(&self) -> bool {
        !matches!(self, Response::Continue)
    }
}

/// Message changes requested by a filter, sent right before the
/// end-of-message response.
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    AddHeader {
        name: String,
        value: String,
    },
    ChangeHeader {
        index: u32,
        name: String,
        value: String,
    },
    Quarantine {
        reason: String,
    },
}

impl Modification {
    fn required_action(&self) -> u32 {
        match self {
            Modification::AddHeader { .. } => actions::ADD_HEADERS,
            Modification::ChangeHeader { .. } => actions::CHANGE_HEADERS,
            Modification::Quarantine { .. } => actions::QUARANTINE,
        }
    }
}

/// Per-message view handed to the callbacks: received headers, macros and
/// the modifications queued so far.
#[derive(Debug, Default)]
pub struct Modifier {
    macros: HashMap<String, String>,
    headers: Vec<(String, String)>,
    modifications: Vec<Modification>,
}

impl Modifier {
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.get(name).map(String::as_str)
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.modifications.push(Modification::AddHeader {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn change_header(&mut self, index: u32, name: impl Into<String>, value: impl Into<String>) {
        self.modifications.push(Modification::ChangeHeader {
            index,
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn quarantine(&mut self, reason: impl Into<String>) {
        self.modifications.push(Modification::Quarantine {
            reason: reason.into(),
        });
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    fn reset_message(&mut self) {
        self.headers.clear();
        self.modifications.clear();
    }
}

/// Callbacks invoked for each stage of an SMTP transaction. A fresh value is
/// created for every message.
#[async_trait]
pub trait Milter: Send {
    async fn connect(
        &mut self,
        _info: &ConnectInfo,
        _m: &mut Modifier,
    ) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    async fn helo(&mut self, _name: &str, _m: &mut Modifier) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    async fn mail_from(&mut self, _from: &str, _m: &mut Modifier) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    async fn rcpt_to(&mut self, _rcpt: &str, _m: &mut Modifier) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    async fn header(
        &mut self,
        _name: &str,
        _value: &str,
        _m: &mut Modifier,
    ) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// End of headers.
    async fn headers(&mut self, _m: &mut Modifier) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    async fn body_chunk(
        &mut self,
        _chunk: &[u8],
        _m: &mut Modifier,
    ) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// End of message; must produce the final verdict.
    async fn body(&mut self, m: &mut Modifier) -> Result<Response, MilterError>;

    async fn abort(&mut self) {}
}

type MilterFactory = dyn Fn() -> Box<dyn Milter> + Send + Sync;

#[derive(Clone)]
pub struct MilterServer {
    factory: Arc<MilterFactory>,
    options: Options,
}

struct MilterSession {
    milter: Box<dyn Milter>,
    modifier: Modifier,
    options: Options,
}

impl MilterServer {
    /// `actions` and `protocol` are the SMFIF_/SMFIP_ masks the filter asks for.
    pub fn new<F>(factory: F, actions: u32, protocol: u32) -> Self
    where
        F: Fn() -> Box<dyn Milter> + Send + Sync + 'static,
    {
        MilterServer {
            factory: Arc::new(factory),
            options: Options {
                version: MILTER_VERSION,
                actions,
                protocol,
            },
        }
    }

    pub async fn handle_client<S>(&self, mut socket: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = MilterSession {
            milter: (self.factory)(),
            modifier: Modifier::default(),
            options: self.options,
        };

        loop {
            let frame = match read_frame(&mut socket).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let command = parse_command(&frame)?;
            if self
                .handle_command(&mut session, command, &mut socket)
                .await?
            {
                return Ok(());
            }
        }
    }

    async fn handle_command<S>(
        &self,
        session: &mut MilterSession,
        command: Command,
        socket: &mut S,
    ) -> Result<bool>
    where
        S: AsyncWrite + Unpin,
    {
        let m = &mut session.modifier;
        let outcome = match command {
            Command::OptionNegotiation(offered) => {
                session.options = self.options.negotiate(&offered);
                debug!(options = ?session.options, "negotiated milter options");
                socket
                    .write_all(&encode_options(&session.options))
                    .await
                    .into_diagnostic()?;
                return Ok(false);
            }
            Command::Macro { macros, .. } => {
                m.macros.extend(macros);
                return Ok(false);
            }
            Command::Connect(info) => session.milter.connect(&info, m).await,
            Command::Helo(name) => session.milter.helo(&name, m).await,
            Command::MailFrom { sender, .. } => session.milter.mail_from(&sender, m).await,
            Command::Rcpt { recipient, .. } => session.milter.rcpt_to(&recipient, m).await,
            Command::Data => Ok(Response::Continue),
            Command::Header { name, value } => {
                let outcome = session.milter.header(&name, &value, m).await;
                m.headers.push((name, value));
                outcome
            }
            Command::EndOfHeaders => session.milter.headers(m).await,
            Command::Body(chunk) => session.milter.body_chunk(&chunk, m).await,
            Command::EndOfBody => {
                let outcome = session.milter.body(m).await;
                if outcome.is_ok() {
                    for modification in m.modifications() {
                        if modification.required_action() & session.options.actions == 0 {
                            warn!(?modification, "MTA did not grant action, dropping");
                            continue;
                        }
                        socket
                            .write_all(&encode_modification(modification))
                            .await
                            .into_diagnostic()?;
                    }
                }
                outcome
            }
            Command::Unknown(_) => Ok(Response::Continue),
            Command::Abort => {
                session.milter.abort().await;
                session.reset(&self.factory);
                return Ok(false);
            }
            Command::QuitNewConnection => {
                session.milter.abort().await;
                session.reset(&self.factory);
                session.modifier.macros.clear();
                return Ok(false);
            }
            Command::Quit => return Ok(true),
        };

        let response = outcome.unwrap_or_else(|e| {
            warn!(error = %e, "milter callback failed, answering tempfail");
            Response::TempFail
        });
        socket
            .write_all(&encode_response(&response))
            .await
            .into_diagnostic()?;
        if response.is_final() {
            session.reset(&self.factory);
        }
        Ok(false)
    }
}

impl MilterSession {
    fn reset(&mut self, factory: &Arc<MilterFactory>) {
        self.milter = factory();
        self.modifier.reset_message();
    }
}

async fn read_frame<S>(socket: &mut S) -> Result<Option<Vec<u8>>, MilterError>
where
    S: AsyncRead + Unpin,
{
    let len = match socket.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(MilterError::FrameSize(len));
    }
    let mut frame = vec![0; len];
    socket.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    struct Recorder {
        reject_on_body: bool,
    }

    #[async_trait]
    impl Milter for Recorder {
        async fn header(
            &mut self,
            name: &str,
            _value: &str,
            _m: &mut Modifier,
        ) -> Result<Response, MilterError> {
            if name == "X-Skip" {
                return Ok(Response::Accept);
            }
            Ok(Response::Continue)
        }

        async fn body(&mut self, m: &mut Modifier) -> Result<Response, MilterError> {
            m.add_header("X-Seen", m.header("subject").unwrap_or("none").to_string());
            if self.reject_on_body {
                return Ok(Response::reply(552, "Message blocked"));
            }
            Ok(Response::Accept)
        }
    }

    fn packet(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        buf.push(code);
        buf.extend_from_slice(payload);
        buf
    }

    async fn read_packet(stream: &mut DuplexStream) -> Vec<u8> {
        read_frame(stream).await.unwrap().unwrap()
    }

    fn spawn_server(reject_on_body: bool) -> DuplexStream {
        let (client, server_side) = duplex(64 * 1024);
        let server = MilterServer::new(
            move || Box::new(Recorder { reject_on_body }) as Box<dyn Milter>,
            actions::ADD_HEADERS,
            protocol::NO_CONNECT | protocol::NO_HELO,
        );
        tokio::spawn(async move { server.handle_client(server_side).await });
        client
    }

    #[tokio::test]
    async fn test_option_negotiation_intersects_masks() {
        let mut client = spawn_server(false);
        let mut payload = 6u32.to_be_bytes().to_vec();
        payload.extend(0x3fu32.to_be_bytes());
        payload.extend(protocol::NO_HELO.to_be_bytes());
        client.write_all(&packet(b'O', &payload)).await.unwrap();

        let reply = read_packet(&mut client).await;
        assert_eq!(reply[0], b'O');
        assert_eq!(&reply[1..5], &6u32.to_be_bytes());
        assert_eq!(&reply[5..9], &actions::ADD_HEADERS.to_be_bytes());
        assert_eq!(&reply[9..13], &protocol::NO_HELO.to_be_bytes());
    }

    #[tokio::test]
    async fn test_message_flow_adds_header_then_replies() {
        let mut client = spawn_server(true);
        let mut payload = 6u32.to_be_bytes().to_vec();
        payload.extend(0x3fu32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        client.write_all(&packet(b'O', &payload)).await.unwrap();
        read_packet(&mut client).await;

        client
            .write_all(&packet(b'M', b"<a@example.com>\0"))
            .await
            .unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'c']);

        client
            .write_all(&packet(b'L', b"Subject\0hello\0"))
            .await
            .unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'c']);

        client.write_all(&packet(b'N', b"")).await.unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'c']);

        client.write_all(&packet(b'B', b"body\r\n")).await.unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'c']);

        client.write_all(&packet(b'E', b"")).await.unwrap();
        assert_eq!(read_packet(&mut client).await, b"hX-Seen\0hello\0".to_vec());
        assert_eq!(
            read_packet(&mut client).await,
            b"y552 Message blocked\0".to_vec()
        );

        client.write_all(&packet(b'Q', b"")).await.unwrap();
    }

    #[tokio::test]
    async fn test_ungranted_modification_is_dropped() {
        let mut client = spawn_server(false);
        // MTA grants no actions at all.
        let mut payload = 6u32.to_be_bytes().to_vec();
        payload.extend(0u32.to_be_bytes());
        payload.extend(0u32.to_be_bytes());
        client.write_all(&packet(b'O', &payload)).await.unwrap();
        read_packet(&mut client).await;

        client.write_all(&packet(b'E', b"")).await.unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'a']);
    }

    #[tokio::test]
    async fn test_final_header_response_resets_message() {
        let mut client = spawn_server(false);
        client
            .write_all(&packet(b'L', b"X-Skip\0yes\0"))
            .await
            .unwrap();
        assert_eq!(read_packet(&mut client).await, vec![b'a']);
    }

    #[tokio::test]
    async fn test_macros_and_abort_need_no_reply() {
        let mut client = spawn_server(false);
        client
            .write_all(&packet(b'D', b"Ci\0QUEUE1\0"))
            .await
            .unwrap();
        client.write_all(&packet(b'A', b"")).await.unwrap();
        client.write_all(&packet(b'T', b"")).await.unwrap();
        // The first reply on the wire belongs to DATA.
        assert_eq!(read_packet(&mut client).await, vec![b'c']);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, server_side) = duplex(1024);
        let server = MilterServer::new(
            || {
                Box::new(Recorder {
                    reject_on_body: false,
                }) as Box<dyn Milter>
            },
            0,
            0,
        );
        let handle = tokio::spawn(async move { server.handle_client(server_side).await });
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(handle.await.unwrap().is_err());
    }
}
