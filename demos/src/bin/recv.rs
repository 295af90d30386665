//! Consumer demo, grounded on `example/recv.py`: loop receiving `Foo`
//! messages from the `example-foo` queue and print each one's fields.
//! Run with `MORP_DSN=dropfile:///tmp/morp-demo cargo run --bin demo-recv`.

use morp_core::error::InterfaceError;
use morp_core::message::{fields_from, process, MessageKind, Outcome, ProcessOpts};
use morp_core::value::{Fields, Value};
use std::time::Duration;

struct Foo {
    bar: i64,
    che: i64,
}

impl MessageKind for Foo {
    const CLASSPATH: &'static str = "demos.Foo";

    fn queue_name() -> &'static str {
        "example-foo"
    }

    fn to_fields(&self) -> Fields {
        fields_from([
            ("bar", Value::Int(self.bar)),
            ("che", Value::Int(self.che)),
        ])
    }

    fn from_fields(fields: Fields) -> Result<Self, InterfaceError> {
        let bar = fields
            .get("bar")
            .and_then(Value::as_i64)
            .ok_or_else(|| InterfaceError::Backend("missing bar".into()))?;
        let che = fields
            .get("che")
            .and_then(Value::as_i64)
            .ok_or_else(|| InterfaceError::Backend("missing che".into()))?;
        Ok(Foo { bar, che })
    }

    fn handle(&self) -> Result<Outcome, String> {
        println!("receiving: bar={}, che={}", self.bar, self.che);
        Ok(Outcome::Ack)
    }
}

#[tokio::main]
async fn main() {
    morp_core::logging::init();
    morp_dropfile::register();
    morp_core::registry::configure_environ();

    let Some(interface) = morp_core::registry::get_interface("") else {
        eprintln!("set MORP_DSN to a dropfile:// (or other registered) DSN first");
        std::process::exit(1);
    };

    if let Err(e) = interface.connect().await {
        eprintln!("failed to connect: {e}");
        std::process::exit(1);
    }

    // Mirrors the original's `while True: with Foo.recv() as f` loop; this
    // demo exits after processing a modest batch rather than running
    // forever, since it's meant to be run to completion and inspected.
    let opts = ProcessOpts {
        ack_on_recv: false,
        recv_timeout: Duration::from_secs(5),
    };

    match process::<Foo>(interface.as_ref(), 10, opts).await {
        Ok(processed) => println!("processed {processed} messages"),
        Err(e) => {
            eprintln!("processing failed: {e}");
            std::process::exit(1);
        }
    }
}
