// Multi-hop routing over a real A-B-C mesh: forwarded requests, replies
// walking back along the path, and continuations.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::timeout;

use qbus::{Message, Outcome, QbusError, Value};

#[tokio::test]
async fn two_hop_request_response() -> Result<()> {
    common::init_logging();
    let (a, b, c) = common::chain_of_three("A", "B", "C").await;

    c.register("ping", |_bus, qin, qout| {
        let n = qin
            .cdata
            .get("n")
            .and_then(Value::as_i64)
            .ok_or_else(|| QbusError::MissingParam("n".into()))?;
        if let Some(qout) = qout {
            let mut out = Value::node();
            out.insert("n", n + 1);
            qout.cdata = out;
        }
        Ok(Outcome::Reply)
    });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    a.send(
        "C",
        "ping",
        common::request_with("n", 7i64),
        move |_bus, qin, _| {
            let _ = reply_tx.send((qin.cdata.take(), qin.err.take()));
            Ok(Outcome::Reply)
        },
    )?;

    let (cdata, err) = timeout(Duration::from_secs(5), reply_rx.recv())
        .await?
        .unwrap();
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(cdata.get("n"), Some(&Value::Int(8)));

    // transitive reachability goes through the middle node on both ends
    assert_eq!(a.route_via("C").as_deref(), Some("B"));
    assert_eq!(c.route_via("A").as_deref(), Some("B"));

    // the reply consumed the chain entries on the caller and the relay
    assert_eq!(a.pending_chains(), 0);
    common::wait_until("the relay chain to clear", || b.pending_chains() == 0).await;
    Ok(())
}

#[tokio::test]
async fn remote_method_miss_reports_not_found() -> Result<()> {
    common::init_logging();
    let (a, _b, _c) = common::chain_of_three("A", "B", "C").await;

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    a.send("C", "absent", Message::new(), move |_bus, qin, _| {
        let _ = reply_tx.send(qin.err.take());
        Ok(Outcome::Reply)
    })?;

    let err = timeout(Duration::from_secs(5), reply_rx.recv())
        .await?
        .unwrap()
        .expect("an error reply");
    assert!(matches!(err, QbusError::NotFound(_)));
    assert!(err.message().contains("method [absent] not found"));
    Ok(())
}

#[tokio::test]
async fn continuation_walks_back_to_the_caller() -> Result<()> {
    common::init_logging();
    let (a, b, c) = common::chain_of_three("A", "B", "C").await;

    let outer_calls = Arc::new(AtomicUsize::new(0));
    {
        let outer_calls = outer_calls.clone();
        b.register("outer", move |bus, qin, _qout| {
            outer_calls.fetch_add(1, Ordering::SeqCst);
            // hand the request on to C; the reply to A is now owed by the
            // continuation, not by this handler
            bus.continue_request("C", "inner", qin, |_bus, qin, qout| {
                if let Some(qout) = qout {
                    qout.cdata = qin.cdata.take();
                }
                Ok(Outcome::Reply)
            })
        });
    }

    c.register("inner", |_bus, _qin, qout| {
        if let Some(qout) = qout {
            let mut out = Value::node();
            out.insert("ok", true);
            qout.cdata = out;
        }
        Ok(Outcome::Reply)
    });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    a.send("B", "outer", Message::new(), move |_bus, qin, _| {
        let _ = reply_tx.send((qin.cdata.take(), qin.err.take()));
        Ok(Outcome::Reply)
    })?;

    let (cdata, err) = timeout(Duration::from_secs(5), reply_rx.recv())
        .await?
        .unwrap();
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(cdata.get("ok"), Some(&Value::Bool(true)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    // the outer handler ran once and was never re-entered for the reply
    assert_eq!(outer_calls.load(Ordering::SeqCst), 1);
    assert!(reply_rx.try_recv().is_err(), "a second reply arrived");
    assert_eq!(a.pending_chains(), 0);
    assert_eq!(b.pending_chains(), 0);
    Ok(())
}

#[tokio::test]
async fn chained_continuations_reach_across_two_relays() -> Result<()> {
    common::init_logging();
    let (a, b, c) = common::chain_of_three("A", "B", "C").await;

    // A -> B outer, B continues to C middle, C continues to A final
    a.register("final", |_bus, _qin, qout| {
        if let Some(qout) = qout {
            let mut out = Value::node();
            out.insert("depth", 3i64);
            qout.cdata = out;
        }
        Ok(Outcome::Reply)
    });
    c.register("middle", |bus, qin, _qout| {
        bus.continue_request("A", "final", qin, |_bus, qin, qout| {
            if let Some(qout) = qout {
                qout.cdata = qin.cdata.take();
            }
            Ok(Outcome::Reply)
        })
    });
    b.register("outer", |bus, qin, _qout| {
        bus.continue_request("C", "middle", qin, |_bus, qin, qout| {
            if let Some(qout) = qout {
                qout.cdata = qin.cdata.take();
            }
            Ok(Outcome::Reply)
        })
    });

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    a.send("B", "outer", Message::new(), move |_bus, qin, _| {
        let _ = reply_tx.send((qin.cdata.take(), qin.err.take()));
        Ok(Outcome::Reply)
    })?;

    let (cdata, err) = timeout(Duration::from_secs(5), reply_rx.recv())
        .await?
        .unwrap();
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(cdata.get("depth"), Some(&Value::Int(3)));
    Ok(())
}
