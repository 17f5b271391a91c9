// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use confab_protocol::{keys, status, Message, Value};
use libconfab::{
    client::{read_response_value, Client, SendOpts},
    Server, StartOpts,
};

pub fn start_server() -> (Server, Client) {
    let server = Server::start(StartOpts::default()).expect("server to start");
    let client = connect(&server);
    (server, client)
}

pub fn connect(server: &Server) -> Client {
    Client::connect(None, server.port()).expect("client to connect")
}

pub fn is_terminal(msg: &Message) -> bool {
    matches!(
        msg.status(),
        Some(status::DONE)
            | Some(status::TIMEOUT)
            | Some(status::INTERRUPTED)
            | Some(status::SERVER_FAILURE)
    )
}

/// Every request gets exactly one terminal status, and it comes last.
pub fn assert_single_terminal(msgs: &[Message]) {
    let terminals: Vec<usize> =
        msgs.iter().enumerate().filter(|(_, m)| is_terminal(m)).map(|(i, _)| i).collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal status in {msgs:?}");
    assert_eq!(terminals[0], msgs.len() - 1, "terminal status comes last in {msgs:?}");
}

/// The printed `value` fields, in arrival order.
pub fn values(msgs: &[Message]) -> Vec<String> {
    msgs.iter().filter_map(|m| m.str_field(keys::VALUE)).map(String::from).collect()
}

/// Evaluate `code` and parse the first printed value back into data,
/// asserting the request terminates cleanly along the way.
pub fn eval_value(client: &Client, code: &str, opts: SendOpts) -> Value {
    let resp = client.send(code, opts).expect("sending request");
    let msgs: Vec<Message> = resp.responses().collect();
    assert_single_terminal(&msgs);
    let msg = msgs.iter().find(|m| m.get(keys::VALUE).is_some()).expect("a value response");
    read_response_value(msg).expect("value to read back").expect("a value")
}
