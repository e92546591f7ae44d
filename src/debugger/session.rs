use crate::debugger::error::Error;
use crate::debugger::transport::Channel;
use crate::{pd_info, pd_warn, weak_error};
use std::sync::mpsc;

/// Client-facing channel of a worker, outside of a debug session. The
/// break notice of a worker waiting for a proxy goes there.
pub trait NoticeSink: Send {
    fn notice(&mut self, message: &str);
}

impl NoticeSink for Vec<String> {
    fn notice(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

impl NoticeSink for mpsc::Sender<String> {
    fn notice(&mut self, message: &str) {
        weak_error!(self.send(message.to_string()), "send notice:");
    }
}

/// Writes notices into the info log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotices;

impl NoticeSink for LogNotices {
    fn notice(&mut self, message: &str) {
        pd_info!(target: "session", "{message}");
    }
}

/// Debug session state of one worker.
///
/// Created empty at worker start, filled by a successful attach, emptied
/// again when the session ends or the connection is lost.
#[derive(Default)]
pub struct DebugContext {
    channel: Option<Channel>,
    client_port: Option<u16>,
    step_into: bool,
    lost_sessions: u64,
}

impl DebugContext {
    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }

    /// Port of a proxy this worker dialed, `None` for sessions where the
    /// proxy dialed in.
    pub fn client_port(&self) -> Option<u16> {
        self.client_port
    }

    pub fn step_into(&self) -> bool {
        self.step_into
    }

    /// Stop on the next statement of the next called routine.
    pub fn set_step_into(&mut self, step_into: bool) {
        self.step_into = step_into;
    }

    /// Number of sessions dropped because of a lost connection.
    pub fn lost_sessions(&self) -> u64 {
        self.lost_sessions
    }

    pub(super) fn open(&mut self, channel: Channel, client_port: Option<u16>) {
        self.channel = Some(channel);
        self.client_port = client_port;
    }

    /// Close the session channel, if any.
    pub fn detach(&mut self) {
        self.channel = None;
        self.client_port = None;
        self.step_into = false;
    }

    pub(super) fn lose(&mut self, err: &Error) {
        pd_warn!(target: "session", "debugger session lost: {err:#}");
        self.detach();
        self.lost_sessions += 1;
    }

    pub fn channel_mut(&mut self) -> Result<&mut Channel, Error> {
        self.channel.as_mut().ok_or(Error::NoSession)
    }
}
