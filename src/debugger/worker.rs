use crate::config::AttachConfig;
use crate::debugger::attach;
use crate::debugger::breakpoint::{Breakpoint, Oid, Registry, SharedRegion, ANY_LINE};
use crate::debugger::command::{self, BreakpointCommand, CommandHandler, Control};
use crate::debugger::error::Error;
use crate::debugger::process::{ProcessIdentity, ProcessTable};
use crate::debugger::session::{DebugContext, NoticeSink};
use crate::{pd_debug, pd_warn, weak_error};

/// Result of a per-statement hook.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum StopOutcome {
    /// No breakpoint here, or the session could not be attached.
    NoStop,
    /// Stopped, served commands, and the proxy let execution continue.
    Resumed,
    /// Stopped, but the session was lost while serving. Execution continues
    /// without debugger.
    SessionLost,
}

/// Debugger state of one worker process: its view of the breakpoint
/// registry and its debug session.
pub struct Worker {
    registry: Registry,
    ctx: DebugContext,
    identity: ProcessIdentity,
    processes: Box<dyn ProcessTable>,
    notices: Box<dyn NoticeSink>,
    config: AttachConfig,
}

impl Worker {
    /// Create a worker.
    ///
    /// # Arguments
    ///
    /// * `region`: worker's own handle onto the shared breakpoint region
    /// * `database_id`: database the worker is connected to
    /// * `identity`: credentials presented to proxies
    /// * `processes`: process table used to verify proxies that dial in
    /// * `notices`: worker's client-facing channel, receives break notices
    /// * `config`: attach settings
    pub fn new(
        region: SharedRegion,
        database_id: Oid,
        identity: ProcessIdentity,
        processes: Box<dyn ProcessTable>,
        notices: Box<dyn NoticeSink>,
        config: AttachConfig,
    ) -> Self {
        Self {
            registry: Registry::new(region, identity.pid, database_id),
            ctx: DebugContext::default(),
            identity,
            processes,
            notices,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn context(&self) -> &DebugContext {
        &self.ctx
    }

    /// Make sure a debug session is attached.
    ///
    /// Return `true` right away if a session is already open, `false` if
    /// there is no breakpoint to attach for or the handshake failed. A
    /// failed attach leaves no session behind, caller must skip the stop.
    pub fn attach(&mut self, breakpoint: Option<&Breakpoint>) -> bool {
        if self.ctx.is_attached() {
            return true;
        }
        let Some(breakpoint) = breakpoint else {
            return false;
        };

        match self.try_attach(breakpoint) {
            Ok(()) => true,
            Err(e) => {
                pd_warn!(target: "attach", "attach debugger: {e:#}");
                self.ctx.detach();
                false
            }
        }
    }

    fn try_attach(&mut self, breakpoint: &Breakpoint) -> Result<(), Error> {
        match breakpoint.data.proxy_port {
            None => {
                let channel = attach::connect_as_server(
                    &self.config,
                    self.processes.as_ref(),
                    self.notices.as_mut(),
                )?;
                self.ctx.open(channel, None);
            }
            Some(port) => {
                let channel = attach::connect_as_client(&self.config, &self.identity, port)?;
                self.ctx.open(channel, Some(port));

                // the peer is the proxy, its breakpoints stop matching for other workers
                if let Some(proxy_pid) = breakpoint.data.proxy_pid {
                    let marked = self.registry.mark_busy_for_proxy(proxy_pid)?;
                    pd_debug!(target: "attach", "{marked} breakpoint(s) of proxy {proxy_pid} marked busy");
                }
            }
        }
        Ok(())
    }

    /// Hook for the start of a routine. A breakpoint on any line of the
    /// routine attaches a session here and the worker stops at the first
    /// statement. Return `true` if such a stop is armed.
    pub fn on_routine_entry(&mut self, routine_id: Oid) -> bool {
        let Some(Some(stop)) = weak_error!(self.registry.find_active(routine_id, ANY_LINE, false))
        else {
            return false;
        };
        if !self.attach(stop.breakpoint.as_ref()) {
            return false;
        }
        self.ctx.set_step_into(true);
        true
    }

    /// Hook for every statement: resolve a breakpoint, attach if needed and
    /// serve proxy commands until the proxy resumes execution.
    ///
    /// # Arguments
    ///
    /// * `routine_id`: routine being executed
    /// * `line_number`: line of the statement
    /// * `handler`: handler of commands other than breakpoint set/clear
    pub fn on_statement(
        &mut self,
        routine_id: Oid,
        line_number: i32,
        handler: &mut dyn CommandHandler,
    ) -> StopOutcome {
        let step_into = self.ctx.step_into();
        if !step_into
            && !weak_error!(self.registry.breakpoints_for_routine(routine_id)).unwrap_or(false)
        {
            return StopOutcome::NoStop;
        }

        let Some(Some(stop)) =
            weak_error!(self.registry.find_active(routine_id, line_number, step_into))
        else {
            return StopOutcome::NoStop;
        };

        if !self.attach(stop.breakpoint.as_ref()) {
            return StopOutcome::NoStop;
        }
        self.ctx.set_step_into(false);

        pd_debug!(
            target: "session",
            "stop at routine {routine_id} line {line_number} ({} scope)",
            stop.scope
        );
        self.serve_stop(handler)
    }

    fn serve_stop(&mut self, handler: &mut dyn CommandHandler) -> StopOutcome {
        loop {
            match self.serve_command(handler) {
                Ok(None) => continue,
                Ok(Some(step_into)) => {
                    self.ctx.set_step_into(step_into);
                    return StopOutcome::Resumed;
                }
                Err(Error::NoSession) => return StopOutcome::NoStop,
                Err(e) if e.is_fatal() => {
                    self.ctx.lose(&e);
                    return StopOutcome::SessionLost;
                }
                Err(e) => pd_warn!(target: "session", "serve debugger command: {e:#}"),
            }
        }
    }

    /// Serve one command. Return `Some(step_into)` when execution should resume.
    fn serve_command(&mut self, handler: &mut dyn CommandHandler) -> Result<Option<bool>, Error> {
        let input = self.ctx.channel_mut()?.read_str()?;

        let reply = match command::parse(&input) {
            Ok(Some(BreakpointCommand::Set {
                routine_id,
                line_number,
            })) => ack(weak_error!(self
                .registry
                .add_local_breakpoint(routine_id, line_number))),
            Ok(Some(BreakpointCommand::Clear {
                routine_id,
                line_number,
            })) => ack(weak_error!(self
                .registry
                .delete_local_breakpoint(routine_id, line_number))),
            Ok(None) => match handler.handle(&input) {
                Control::Reply(reply) => reply,
                Control::Resume { step_into } => {
                    self.ctx.channel_mut()?.send_bool(true)?;
                    return Ok(Some(step_into));
                }
            },
            Err(e) => {
                pd_warn!(target: "session", "{e}");
                ack(None)
            }
        };

        self.ctx.channel_mut()?.send_string(&reply)?;
        Ok(None)
    }
}

fn ack(done: Option<bool>) -> String {
    let ack = if done == Some(true) { "t" } else { "f" };
    ack.to_string()
}
