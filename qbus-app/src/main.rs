// qbus-app
//
// A minimal bus module: binds 127.0.0.1:8090 unless configured otherwise
// and answers `echo` and `add`. Point a second instance at it with
// `-d 127.0.0.1:8090 -k name peer` to try a remote call.

use anyhow::Result;

use qbus::{instance, Outcome, QbusError, Value};

fn main() -> Result<()> {
    instance::run(
        "test",
        |bus| {
            // inserted as a default so it persists into test.json
            bus.config_str("b", "127.0.0.1:8090");

            bus.register("echo", |_bus, qin, qout| {
                if let Some(qout) = qout {
                    qout.cdata = qin.cdata.take();
                }
                Ok(Outcome::Reply)
            });

            bus.register("add", |_bus, qin, qout| {
                let a = qin
                    .cdata
                    .get("a")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| QbusError::MissingParam("a".into()))?;
                let b = qin
                    .cdata
                    .get("b")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| QbusError::MissingParam("b".into()))?;
                if let Some(qout) = qout {
                    let mut sum = Value::node();
                    sum.insert("sum", a + b);
                    qout.cdata = sum;
                }
                Ok(Outcome::Reply)
            });

            Ok(())
        },
        |_bus, _state: ()| Ok(()),
    )
}
