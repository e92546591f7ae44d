use crate::common::{break_port, handler, identity, known, loopback, Group};
use nix::unistd::Pid;
use pldbg::config::AttachConfig;
use pldbg::debugger::breakpoint::{Breakpoint, BreakpointData, BreakpointKey, Target};
use pldbg::debugger::error::Error;
use pldbg::debugger::process::{IdentityToken, ProcessIdentity};
use pldbg::debugger::transport::Channel;
use pldbg::debugger::StopOutcome;
use pldbg::proxy::ProxySession;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

fn global_breakpoint(port: u16, proxy_pid: i32) -> Breakpoint {
    Breakpoint {
        key: BreakpointKey::new(crate::common::DB, 10, 1, Target::Any),
        data: BreakpointData::global(port, Pid::from_raw(proxy_pid)),
    }
}

#[test]
fn test_server_role_keeps_listening_after_bad_credentials() {
    let group = Group::new(8);
    let proxy = identity(4321);
    let (notice_tx, notice_rx) = mpsc::channel();

    let mut worker = group.worker(identity(100), known(&[proxy]), notice_tx, loopback());
    worker.registry_mut().add_local_breakpoint(10, 3).unwrap();

    let worker_thread = thread::spawn(move || {
        let first = worker.on_statement(10, 3, &mut handler);
        let second = worker.on_statement(10, 20, &mut handler);
        let third = worker.on_statement(10, 21, &mut handler);
        (worker, [first, second, third])
    });

    let port = break_port(&notice_rx);

    // pid is known, token is not
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut forged = Channel::from_tcp(stream).unwrap();
    forged.write_u32(4321).unwrap();
    forged.write_token(IdentityToken(1)).unwrap();
    assert!(!forged.get_bool().unwrap());
    assert!(matches!(forged.read_str(), Err(Error::ConnectionClosed)));

    // unknown pid
    assert!(matches!(
        ProxySession::attach_to_target("127.0.0.1", port, &identity(4322)),
        Err(Error::TargetRejected)
    ));

    let mut session = ProxySession::attach_to_target("127.0.0.1", port, &proxy).unwrap();
    assert_eq!(session.target_version(), Some("1.0"));

    assert!(session.set_breakpoint(10, 20).unwrap());
    assert!(!session.set_breakpoint(10, 20).unwrap());
    assert_eq!(session.request("b 10").unwrap(), "f");
    assert_eq!(session.request("where").unwrap(), "echo where");
    assert_eq!(session.request("c").unwrap(), "t");

    // stop at line 20, set from the proxy
    assert!(session.clear_breakpoint(10, 20).unwrap());
    assert!(!session.clear_breakpoint(10, 20).unwrap());
    assert_eq!(session.request("c").unwrap(), "t");

    let (worker, outcomes) = worker_thread.join().unwrap();
    assert_eq!(
        outcomes,
        [StopOutcome::Resumed, StopOutcome::Resumed, StopOutcome::NoStop]
    );
    assert!(worker.context().is_attached());
    assert_eq!(worker.context().client_port(), None);
    assert!(notice_rx.try_recv().is_err());
}

/// Proxy double answering the worker handshake with a fixed acknowledgement.
fn fake_proxy(ack: bool, version: &'static str) -> (u16, thread::JoinHandle<Option<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut channel = Channel::from_tcp(stream).unwrap();
        channel.read_u32().unwrap();
        channel.read_token().unwrap();
        channel.send_bool(ack).unwrap();

        let worker_version = channel.read_str().ok()?;
        channel.send_string(version).unwrap();
        Some(worker_version)
    });
    (port, handle)
}

#[test]
fn test_client_role_refused_credentials_lenient() {
    let group = Group::new(8);
    let mut worker = group.worker(identity(100), known(&[]), Vec::<String>::new(), loopback());

    let (port, proxy) = fake_proxy(false, "");
    assert!(worker.attach(Some(&global_breakpoint(port, 7000))));
    assert!(worker.context().is_attached());
    assert_eq!(worker.context().client_port(), Some(port));
    assert_eq!(proxy.join().unwrap().as_deref(), Some("1.0"));

    // already attached, no handshake at all
    assert!(worker.attach(Some(&global_breakpoint(1, 7000))));
    assert!(worker.attach(None));
}

#[test]
fn test_client_role_refused_credentials_strict() {
    let group = Group::new(8);
    let config = AttachConfig {
        strict_proxy_auth: true,
        ..loopback()
    };
    let mut worker = group.worker(identity(100), known(&[]), Vec::<String>::new(), config);

    let (port, proxy) = fake_proxy(false, "1.0");
    assert!(!worker.attach(Some(&global_breakpoint(port, 7000))));
    assert!(!worker.context().is_attached());
    assert_eq!(proxy.join().unwrap(), None);

    let (port, proxy) = fake_proxy(true, "1.0");
    assert!(worker.attach(Some(&global_breakpoint(port, 7000))));
    assert_eq!(proxy.join().unwrap().as_deref(), Some("1.0"));
}

#[test]
fn test_failed_attach_skips_stop() {
    let group = Group::new(8);
    let mut worker = group.worker(identity(100), known(&[]), Vec::<String>::new(), loopback());

    assert!(!worker.attach(None));

    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    assert!(!worker.attach(Some(&global_breakpoint(closed_port, 7000))));
    assert!(!worker.context().is_attached());

    // same through the statement hook
    let proxy_pid = Pid::from_raw(7000);
    let key = BreakpointKey::new(crate::common::DB, 10, 1, Target::Any);
    worker
        .registry_mut()
        .insert(
            pldbg::debugger::breakpoint::Scope::Global,
            &key,
            &BreakpointData::global(closed_port, proxy_pid),
        )
        .unwrap();
    assert_eq!(
        worker.on_statement(10, 1, &mut handler),
        StopOutcome::NoStop
    );
}

#[test]
fn test_system_identity_handshake() {
    use pldbg::debugger::process::SystemProcessTable;
    use pldbg::debugger::transport::PROTOCOL_VERSION;

    let me = ProcessIdentity::current(&SystemProcessTable).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let proxy = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut channel = Channel::from_tcp(stream).unwrap();
        let pid = channel.read_u32().unwrap();
        let token = channel.read_token().unwrap();
        let genuine = ProcessIdentity {
            pid: Pid::from_raw(pid as i32),
            token,
        }
        .verify(&SystemProcessTable);
        channel.send_bool(genuine).unwrap();
        channel.read_str().unwrap();
        channel.send_string(PROTOCOL_VERSION).unwrap();
        genuine
    });

    let config = AttachConfig {
        strict_proxy_auth: true,
        ..loopback()
    };
    pldbg::debugger::attach::connect_as_client(&config, &me, port).unwrap();
    assert!(proxy.join().unwrap());
}
