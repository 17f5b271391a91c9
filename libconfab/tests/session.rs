use confab_protocol::Value;
use libconfab::client::SendOpts;
use ntest::timeout;

mod support;

use support::{connect, eval_value, start_server};

fn with_session(id: &str) -> SendOpts {
    SendOpts { session_id: Some(String::from(id)), ..Default::default() }
}

#[test]
#[timeout(30000)]
fn retained_sessions_survive_reconnects() {
    let (server, client1) = start_server();

    eval_value(&client1, "(def x 1)", SendOpts::default());
    let sid = match eval_value(&client1, "(retain-session)", SendOpts::default()) {
        Value::Str(sid) => sid,
        other => panic!("retain-session returns the id string, got {other}"),
    };
    client1.close().expect("closing first connection");

    let client2 = connect(&server);
    assert_eq!(eval_value(&client2, "x", with_session(&sid)), Value::Int(1));
}

#[test]
#[timeout(30000)]
fn sessions_carry_ns_and_history_across_connections() {
    let (server, client1) = start_server();

    eval_value(&client1, "(in-ns \"scratch\")", SendOpts::default());
    eval_value(&client1, "41 42", SendOpts::default());
    let sid = match eval_value(&client1, "(retain-session)", SendOpts::default()) {
        Value::Str(sid) => sid,
        other => panic!("retain-session returns the id string, got {other}"),
    };

    let client2 = connect(&server);
    assert_eq!(
        eval_value(&client2, "(list *ns* *1)", with_session(&sid)),
        Value::parse("(scratch 42)").unwrap(),
    );
}

#[test]
#[timeout(30000)]
fn the_session_binding_sticks_for_later_requests() {
    let (server, client1) = start_server();

    eval_value(&client1, "(in-ns \"scratch\")", SendOpts::default());
    let sid = match eval_value(&client1, "(retain-session)", SendOpts::default()) {
        Value::Str(sid) => sid,
        other => panic!("retain-session returns the id string, got {other}"),
    };

    let client2 = connect(&server);
    // the first request names the session; the second one rides the
    // connection's rebound session pointer
    assert_eq!(eval_value(&client2, "*ns*", with_session(&sid)), Value::sym("scratch"));
    assert_eq!(eval_value(&client2, "*ns*", SendOpts::default()), Value::sym("scratch"));
}

#[test]
#[timeout(30000)]
fn released_sessions_are_forgotten() {
    let (server, client1) = start_server();

    eval_value(&client1, "(in-ns \"scratch\")", SendOpts::default());
    let sid = match eval_value(&client1, "(retain-session)", SendOpts::default()) {
        Value::Str(sid) => sid,
        other => panic!("retain-session returns the id string, got {other}"),
    };
    assert_eq!(
        eval_value(&client1, "(release-session)", SendOpts::default()),
        Value::Bool(true),
    );
    assert_eq!(
        eval_value(&client1, "(release-session)", SendOpts::default()),
        Value::Bool(false),
        "releasing twice reports the session was not retained",
    );

    // naming the released session now has no effect, the connection
    // keeps its own fresh session
    let client2 = connect(&server);
    assert_eq!(eval_value(&client2, "*ns*", with_session(&sid)), Value::sym("user"));
}

#[test]
#[timeout(30000)]
fn unretained_sessions_are_private_to_their_connection() {
    let (server, client1) = start_server();

    eval_value(&client1, "(in-ns \"scratch\")", SendOpts::default());

    let client2 = connect(&server);
    assert_eq!(eval_value(&client2, "*ns*", SendOpts::default()), Value::sym("user"));
}

#[test]
#[timeout(30000)]
fn retaining_twice_returns_the_same_id() {
    let (_server, client) = start_server();

    let first = eval_value(&client, "(retain-session)", SendOpts::default());
    let second = eval_value(&client, "(retain-session)", SendOpts::default());
    assert_eq!(first, second);
}
