use std::{thread, time::Duration};

use opentsdb_client::{ClientBuilder, TraceCodec};

fn main() {
    tracing_subscriber::fmt::init();

    let client = ClientBuilder::default()
        .with_remote_address("localhost:4242")
        .expect("failed to parse remote address")
        .with_codec(TraceCodec::Put)
        .with_app("tcp-put-loop")
        .build()
        .expect("failed to connect to server");

    // Loop over and over, pretending to do some work.
    let mut iteration = 0u64;
    loop {
        iteration += 1;

        client.trace("example.loop.iterations", iteration as i64, [("kind", "tcp")]).expect("invalid data point");
        client.trace("example.loop.load", (iteration % 100) as f64 / 100.0, [("kind", "tcp")]).expect("invalid data point");

        if iteration % 10 == 0 {
            if let Err(e) = client.flush() {
                eprintln!("flush failed: {e}");
            }
            println!("{:?}", client.stats());
        }

        thread::sleep(Duration::from_millis(100));
    }
}
