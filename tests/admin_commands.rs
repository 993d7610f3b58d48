//! Admin command flow through the shell's command decoder and handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ballotbox::bot::{handle_admin, Reply};
use ballotbox::clock::ManualClock;
use ballotbox::command::Command;
use ballotbox::controller::{ControllerSettings, SessionController};
use ballotbox::error::EngineError;
use ballotbox::gate::{MembershipOracle, MembershipStatus};
use ballotbox::store::Store;

const ADMIN: i64 = 1;

struct Everyone;

#[async_trait]
impl MembershipOracle for Everyone {
    async fn status(&self, _group_id: &str, _voter_id: i64) -> anyhow::Result<MembershipStatus> {
        Ok(MembershipStatus::Member)
    }
}

fn engine() -> SessionController {
    let store = Store::open_in_memory().unwrap();
    store.init().unwrap();
    SessionController::new(
        store,
        Arc::new(Everyone),
        Arc::new(ManualClock::at_ms(0)),
        ControllerSettings {
            admins: [ADMIN].into_iter().collect(),
            oracle_timeout: Duration::from_millis(100),
            input_ttl: Duration::from_secs(300),
        },
    )
}

fn run(engine: &SessionController, admin: i64, text: &str) -> Result<Reply, EngineError> {
    handle_admin(engine, admin, &Command::from_text(text))
}

fn text_of(reply: Reply) -> String {
    match reply {
        Reply::Text(t) => t,
        other => panic!("expected text, got {:?}", other),
    }
}

#[test]
fn bulk_add_then_remove_by_rank() {
    let engine = engine();
    text_of(run(&engine, ADMIN, "/bulk").unwrap());
    let outcome = engine.submit_input(ADMIN, "Ali\nVali\nali\n").unwrap();
    assert!(outcome.is_some());

    let listing = text_of(run(&engine, ADMIN, "/candidates").unwrap());
    assert!(listing.starts_with("1. Ali"));
    assert!(listing.contains("2. Vali"));

    let removed = text_of(run(&engine, ADMIN, "/remove #2").unwrap());
    assert!(removed.contains("Vali"));
    assert!(matches!(run(&engine, ADMIN, "/remove #2"), Err(EngineError::NotFound)));
}

#[test]
fn non_admin_commands_are_unauthorized() {
    let engine = engine();
    engine.add_gate(ADMIN, "@secret_channel", Some("https://t.me/+private")).unwrap();
    for cmd in [
        "/add Ali", "/close", "/open", "/reset", "/export", "/timer 5", "/gate_add @x", "/bulk",
        "/gates", "/candidates", "/cancel", "/stats", "/bogus", "/add",
    ] {
        assert!(
            matches!(run(&engine, 77, cmd), Err(EngineError::Unauthorized)),
            "{} should be refused",
            cmd
        );
    }
    assert!(engine.candidates().unwrap().is_empty());
    assert_eq!(engine.gates().unwrap().len(), 1);

    // The voter-facing commands stay open to everyone.
    assert_eq!(run(&engine, 77, "/start").unwrap(), Reply::Ballot);
    assert!(text_of(run(&engine, 77, "/results").unwrap()).contains("Total: 0"));
}

#[tokio::test]
async fn export_produces_csv_document() {
    let engine = engine();
    run(&engine, ADMIN, "/add Ali").unwrap();
    let ali = engine.candidates().unwrap()[0].id;
    engine.cast_vote(5, ali).await.unwrap();

    match run(&engine, ADMIN, "/export").unwrap() {
        Reply::Document { file_name, bytes, .. } => {
            assert_eq!(file_name, "ballots.csv");
            let csv = String::from_utf8(bytes).unwrap();
            let mut lines = csv.lines();
            assert_eq!(lines.next(), Some("voter_id,candidate_id,candidate_name,cast_at"));
            assert_eq!(lines.next(), Some(format!("5,{},Ali,1970-01-01T00:00:00Z", ali).as_str()));
        }
        other => panic!("expected document, got {:?}", other),
    }
}

#[tokio::test]
async fn close_and_open_commands_drive_the_window() {
    let engine = engine();
    run(&engine, ADMIN, "/add Ali").unwrap();
    let ali = engine.candidates().unwrap()[0].id;

    run(&engine, ADMIN, "/close").unwrap();
    assert!(matches!(engine.cast_vote(1, ali).await, Err(EngineError::VotingClosed)));
    run(&engine, ADMIN, "/open").unwrap();
    assert!(engine.cast_vote(1, ali).await.is_ok());
    assert_eq!(text_of(run(&engine, ADMIN, "/stats").unwrap()), "Ballots cast: 1");
}

#[test]
fn cancel_clears_pending_input() {
    let engine = engine();
    run(&engine, ADMIN, "/gate_add").unwrap();
    assert_eq!(text_of(run(&engine, ADMIN, "/cancel").unwrap()), "Cancelled");
    assert_eq!(engine.submit_input(ADMIN, "@chan").unwrap(), None);
    assert_eq!(text_of(run(&engine, ADMIN, "/cancel").unwrap()), "Nothing to cancel");
}
