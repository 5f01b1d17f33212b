use futures_util::StreamExt;
use polylogue::protocol::canonical::{Message, StopReason, StreamEvent};
use polylogue::{EngineError, PersistentConnection, TurnRequest};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Harness {
    connection: PersistentConnection,
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
}

fn harness() -> Harness {
    let (sink, outbound) = mpsc::channel::<String>(16);
    let (inbound, source) = mpsc::channel::<String>(16);
    Harness {
        connection: PersistentConnection::new(Box::new(sink), Box::new(source)),
        outbound,
        inbound,
    }
}

async fn next_frame(outbound: &mut mpsc::Receiver<String>) -> Value {
    let frame = outbound.recv().await.expect("outbound frame");
    serde_json::from_str(&frame).expect("frame is json")
}

#[tokio::test]
async fn second_turn_is_refused_while_one_is_in_flight() {
    let mut h = harness();
    let history = vec![Message::user("hi")];

    let _first = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("first turn");
    let frame = next_frame(&mut h.outbound).await;
    assert_eq!(frame["type"], "response.create");
    assert_eq!(frame["model"], "gpt-test");
    assert!(frame.get("stream").is_none());

    let refused = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .err()
        .expect("second turn refused");
    assert!(matches!(refused, EngineError::InvalidRequest(_)));
    assert!(h.outbound.try_recv().is_err());
}

#[tokio::test]
async fn completed_turn_frees_the_connection() {
    let mut h = harness();
    let history = vec![Message::user("hi")];
    let mut turn = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("turn");
    next_frame(&mut h.outbound).await;

    for frame in [
        json!({"type": "response.created", "response": {"id": "resp_1"}}),
        json!({"type": "response.output_text.delta", "item_id": "msg_1", "delta": "hello"}),
        json!({"type": "response.completed", "response": {"id": "resp_1", "status": "completed"}}),
    ] {
        h.inbound.send(frame.to_string()).await.expect("inbound");
    }

    assert_eq!(
        turn.next().await,
        Some(StreamEvent::MessageStart { id: "resp_1".to_string() })
    );
    assert_eq!(turn.next().await, Some(StreamEvent::text("hello")));
    assert_eq!(
        turn.next().await,
        Some(StreamEvent::MessageEnd {
            usage: None,
            stop_reason: Some(StopReason::EndOfTurn),
        })
    );
    assert!(!h.connection.is_busy());
    assert_eq!(turn.next().await, None);
}

#[tokio::test]
async fn cancel_sends_cancel_frame_once_response_id_is_known() {
    let mut h = harness();
    let history = vec![Message::user("write a long story")];
    let mut turn = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("turn");
    next_frame(&mut h.outbound).await;

    h.inbound
        .send(json!({"type": "response.created", "response": {"id": "resp_42"}}).to_string())
        .await
        .expect("inbound");
    assert_eq!(
        turn.next().await,
        Some(StreamEvent::MessageStart { id: "resp_42".to_string() })
    );

    turn.cancel().await.expect("cancel");
    assert_eq!(
        next_frame(&mut h.outbound).await,
        json!({"type": "response.cancel", "response_id": "resp_42"})
    );
    assert!(!h.connection.is_busy());
    assert_eq!(turn.next().await, None);
    drop(turn);

    // the server flushes the rest of the cancelled response before the next turn
    for frame in [
        json!({"type": "response.output_text.delta", "item_id": "msg_old", "delta": "OLD"}),
        json!({"type": "response.cancelled", "response": {"id": "resp_42"}}),
    ] {
        h.inbound.send(frame.to_string()).await.expect("inbound");
    }
    let mut next = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("connection reusable after cancel");
    assert_eq!(next_frame(&mut h.outbound).await["type"], "response.create");

    for frame in [
        json!({"type": "response.created", "response": {"id": "resp_43"}}),
        json!({"type": "response.output_text.delta", "item_id": "msg_new", "delta": "NEW"}),
        json!({"type": "response.completed", "response": {"id": "resp_43", "status": "completed"}}),
    ] {
        h.inbound.send(frame.to_string()).await.expect("inbound");
    }
    let events: Vec<StreamEvent> = (&mut next).collect().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::MessageStart { id: "resp_43".to_string() },
            StreamEvent::text("NEW"),
            StreamEvent::MessageEnd {
                usage: None,
                stop_reason: Some(StopReason::EndOfTurn),
            },
        ]
    );
}

#[tokio::test]
async fn abandoned_response_is_cancelled_and_drained_by_the_next_turn() {
    let mut h = harness();
    let history = vec![Message::user("hi")];
    let turn = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("turn");
    next_frame(&mut h.outbound).await;
    drop(turn);
    assert!(!h.connection.is_busy());

    for frame in [
        json!({"type": "response.created", "response": {"id": "resp_old"}}),
        json!({"type": "response.output_text.delta", "item_id": "msg_old", "delta": "OLD"}),
        json!({"type": "response.cancelled", "response": {"id": "resp_old"}}),
        json!({"type": "response.created", "response": {"id": "resp_new"}}),
        json!({"type": "response.completed", "response": {"id": "resp_new", "status": "completed"}}),
    ] {
        h.inbound.send(frame.to_string()).await.expect("inbound");
    }

    let next = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("second turn");
    assert_eq!(
        next_frame(&mut h.outbound).await,
        json!({"type": "response.cancel", "response_id": "resp_old"})
    );
    assert_eq!(next_frame(&mut h.outbound).await["type"], "response.create");

    let events: Vec<StreamEvent> = next.collect().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::MessageStart { id: "resp_new".to_string() },
            StreamEvent::MessageEnd {
                usage: None,
                stop_reason: Some(StopReason::EndOfTurn),
            },
        ]
    );
    assert!(!h.connection.is_busy());
}

#[tokio::test]
async fn cancel_before_response_id_sends_nothing() {
    let mut h = harness();
    let history = vec![Message::user("hi")];
    let turn = h
        .connection
        .start_turn(TurnRequest::new(&history, "gpt-test"))
        .await
        .expect("turn");
    next_frame(&mut h.outbound).await;

    turn.cancel().await.expect("cancel");
    assert!(h.outbound.try_recv().is_err());
    assert!(!h.connection.is_busy());
}
