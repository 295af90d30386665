//! Producer demo, grounded on `example/send.py`: build one `Foo` message
//! with a couple of random fields and send it to the `example-foo` queue.
//! Run with `MORP_DSN=dropfile:///tmp/morp-demo cargo run --bin demo-send`.

use morp_core::error::InterfaceError;
use morp_core::message::{fields_from, send, MessageKind, Outcome, SendOpts};
use morp_core::value::{Fields, FieldsExt, Value};

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
        println!("bar: {}, che: {}", self.bar, self.che);
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

    let message = Foo {
        bar: rand::random::<u16>() as i64 % 500,
        che: rand::random::<u16>() as i64 % 500,
    };

    match send(interface.as_ref(), &message, SendOpts::default()).await {
        Ok(fields) => println!("sent: bar={}, che={}, id={:?}", message.bar, message.che, fields.id()),
        Err(e) => {
            eprintln!("send failed: {e}");
            std::process::exit(1);
        }
    }
}
