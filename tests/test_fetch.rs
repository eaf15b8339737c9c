//! Integration tests for the FETCH command

mod common;

use common::*;

fn envelope(n: u32) -> String {
    let mail = mail(n);
    format!(
        "* {} FETCH (ENVELOPE (\"{}\" \"{}\" \"{}\" \"{}\"))",
        n,
        mail.sent_at.to_rfc2822(),
        mail.subject,
        mail.sender,
        mail.recipient
    )
}

#[tokio::test]
async fn test_fetch_envelope_range() {
    let (mut client, _handle) = selected_session().await;

    client.send("f1 FETCH 1:2 ENVELOPE").await;
    client.expect(&envelope(1)).await;
    client.expect(&envelope(2)).await;
    client.expect("f1 OK FETCH completed").await;
}

#[tokio::test]
async fn test_fetch_body_literal() {
    let (mut client, _handle) = selected_session().await;
    let body = mail(2).body;

    client.send("f1 FETCH 2 RFC822").await;
    client.expect(&format!("* 2 FETCH (RFC822 {{{}}}", body.len())).await;
    client.expect(&format!("{})", body)).await;
    client.expect("f1 OK FETCH completed").await;

    client.send("f2 FETCH 2 body[]").await;
    client.expect(&format!("* 2 FETCH (BODY[] {{{}}}", body.len())).await;
    client.expect(&format!("{})", body)).await;
    client.expect("f2 OK FETCH completed").await;
}

#[tokio::test]
async fn test_fetch_flags_with_list_and_parens() {
    let (mut client, _handle) = selected_session().await;

    client.send("f1 FETCH 3,1 (FLAGS)").await;
    client.expect("* 1 FETCH (FLAGS (\\Seen))").await;
    client.expect("* 3 FETCH (FLAGS (\\Seen))").await;
    client.expect("f1 OK FETCH completed").await;
}

#[tokio::test]
async fn test_fetch_skips_missing_messages() {
    let (mut client, _handle) = selected_session().await;

    client.send("f1 FETCH 0,2:5 FLAGS").await;
    client.expect("* 2 FETCH (FLAGS (\\Seen))").await;
    client.expect("* 3 FETCH (FLAGS (\\Seen))").await;
    client.expect("f1 OK FETCH completed").await;

    client.send("f2 FETCH 5:2 FLAGS").await;
    client.expect("f2 OK FETCH completed").await;
}

#[tokio::test]
async fn test_fetch_unsupported_attribute_sends_nothing_else() {
    let (mut client, _handle) = selected_session().await;

    client.send("f1 FETCH 1:3 UID").await;
    client.expect("f1 BAD Unsupported fetch attribute: UID").await;

    // The next line belongs to the next command: no partial output above
    client.send("f2 FETCH 1 FLAGS").await;
    client.expect("* 1 FETCH (FLAGS (\\Seen))").await;
    client.expect("f2 OK FETCH completed").await;
}

#[tokio::test]
async fn test_fetch_malformed_item_set() {
    let (mut client, _handle) = selected_session().await;

    client.send("f1 FETCH x FLAGS").await;
    client.expect("f1 BAD invalid message index \"x\"").await;

    client.send("f2 FETCH 1:20000 FLAGS").await;
    client.expect("f2 BAD item set expands to more than 10000 messages").await;

    client.send("f3 FETCH 1").await;
    client.expect("f3 BAD FETCH requires an item set and an attribute").await;
}

#[tokio::test]
async fn test_fetch_phase_allows_more_fetches_and_logout() {
    let (mut client, handle) = selected_session().await;

    client.send("f1 FETCH 1 FLAGS").await;
    client.expect("* 1 FETCH (FLAGS (\\Seen))").await;
    client.expect("f1 OK FETCH completed").await;

    client.send("f2 CAPABILITY").await;
    client.expect("f2 BAD Bad sequence of commands").await;
    client.send("f3 SELECT Archive").await;
    client.expect("f3 BAD Bad sequence of commands").await;

    client.send("f4 FETCH 3 FLAGS").await;
    client.expect("* 3 FETCH (FLAGS (\\Seen))").await;
    client.expect("f4 OK FETCH completed").await;

    client.send("f5 LOGOUT").await;
    client.expect("* BYE testmail logging out").await;
    client.expect("f5 OK LOGOUT completed").await;
    client.assert_closed().await;

    let (result, phase) = handle.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(phase, quaymail::Phase::LoggedOut);
}

#[tokio::test]
async fn test_fetch_empty_mailbox() {
    let (mut client, _handle) = authenticated_session().await;
    client.send("s1 SELECT Archive").await;
    client.expect("* 0 EXISTS").await;
    client.expect("s1 OK SELECT completed").await;

    client.send("f1 FETCH 1:3 ENVELOPE").await;
    client.expect("f1 OK FETCH completed").await;
}
