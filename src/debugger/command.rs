//! Commands a proxy sends over the session channel.
//!
//! Only breakpoint commands are handled here:
//!
//! * `b <routine>:<line>` set a local breakpoint
//! * `f <routine>:<line>` clear a local breakpoint
//!
//! Everything else goes to a [`CommandHandler`] supplied by the embedding
//! runtime.

use crate::debugger::breakpoint::Oid;
use crate::debugger::error::Error;
use itertools::Itertools;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BreakpointCommand {
    Set { routine_id: Oid, line_number: i32 },
    Clear { routine_id: Oid, line_number: i32 },
}

/// Parse a breakpoint command. Return `Ok(None)` if input is not a breakpoint command.
pub fn parse(input: &str) -> Result<Option<BreakpointCommand>, Error> {
    let input = input.trim_start();
    let (name, spec) = input
        .split_once(char::is_whitespace)
        .unwrap_or((input, ""));

    let set = match name {
        "b" => true,
        "f" => false,
        _ => return Ok(None),
    };

    let (routine_id, line_number) = parse_location(spec.trim())?;
    Ok(Some(if set {
        BreakpointCommand::Set {
            routine_id,
            line_number,
        }
    } else {
        BreakpointCommand::Clear {
            routine_id,
            line_number,
        }
    }))
}

fn parse_location(spec: &str) -> Result<(Oid, i32), Error> {
    let malformed = || Error::BreakpointFormat(spec.to_string());

    let (routine, line) = spec.split(':').collect_tuple().ok_or_else(malformed)?;
    let routine_id = routine.trim().parse::<Oid>().map_err(|_| malformed())?;
    let line_number = line.trim().parse::<i32>().map_err(|_| malformed())?;
    Ok((routine_id, line_number))
}

/// What a worker does after a command is handled.
#[derive(Debug, PartialEq, Clone)]
pub enum Control {
    /// Send a reply and wait for the next command.
    Reply(String),
    /// Acknowledge, leave the stop and continue execution. With `step_into` the worker
    /// stops again at the first statement of the next called routine.
    Resume { step_into: bool },
}

/// Handles commands a worker does not understand itself (stack, variables,
/// stepping and so on).
pub trait CommandHandler {
    fn handle(&mut self, command: &str) -> Control;
}

impl<F: FnMut(&str) -> Control> CommandHandler for F {
    fn handle(&mut self, command: &str) -> Control {
        self(command)
    }
}
