use std::{thread, time::Duration};

use opentsdb_client::{ClientBuilder, TraceCodec};

fn main() {
    tracing_subscriber::fmt::init();

    let mut client = ClientBuilder::default()
        .with_remote_address("udp://127.0.0.1:4242")
        .expect("failed to parse remote address")
        .with_codec(TraceCodec::JsonText)
        .with_gzip(true)
        .with_maximum_datagram_length(1400)
        .with_telemetry(true)
        .build()
        .expect("failed to bind socket");

    // Server statistics flow back through the client every five seconds.
    client.spawn_stats_relay(Duration::from_secs(5)).expect("failed to spawn stats relay");

    for i in 0..1000 {
        client.trace("example.udp.points", i, [("shard", (i % 4).to_string())]).expect("invalid data point");
        if i % 100 == 99 {
            client.flush().expect("flush failed");
        }
        thread::sleep(Duration::from_millis(10));
    }

    println!("{}", client.print_current_buffer());
    client.close();
}
