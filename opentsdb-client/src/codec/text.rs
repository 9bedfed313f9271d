use crate::{
    buffer::TraceBuffer,
    point::{Tags, Value},
};

const PUT_PREFIX: &[u8] = b"put ";

/// Writes one `<metric> <timestamp> <value> <key>=<value>...` record, terminated by a newline.
pub(super) fn write_record(
    sink: &mut TraceBuffer,
    telnet: bool,
    timestamp: i64,
    metric: &str,
    value: Value,
    tags: &Tags,
) {
    if telnet {
        sink.extend_from_slice(PUT_PREFIX);
    }

    sink.extend_from_slice(metric.trim().as_bytes());
    sink.extend_from_slice(b" ");
    sink.extend_from_slice(itoa::Buffer::new().format(timestamp).as_bytes());
    sink.extend_from_slice(b" ");
    match value {
        Value::Integer(v) => sink.extend_from_slice(itoa::Buffer::new().format(v).as_bytes()),
        Value::Float(v) => sink.extend_from_slice(ryu::Buffer::new().format(v).as_bytes()),
    }

    for (key, value) in tags {
        sink.extend_from_slice(b" ");
        sink.extend_from_slice(key.as_bytes());
        sink.extend_from_slice(b"=");
        sink.extend_from_slice(value.as_bytes());
    }

    sink.extend_from_slice(b"\n");
}

#[cfg(test)]
mod tests {
    use proptest::{collection::btree_map as arb_btree_map, prelude::*, proptest};

    use super::write_record;
    use crate::{
        buffer::BufferManager,
        point::{DataPoint, Value},
    };

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::Integer),
            (-1.0e12f64..1.0e12f64).prop_map(Value::Float),
        ]
    }

    fn arb_point() -> impl Strategy<Value = DataPoint> {
        let name_regex = "[a-zA-Z0-9_./-]{1,32}";
        let tags = arb_btree_map("[a-z]{1,8}", "[a-zA-Z0-9_./-]{1,16}", 1..5);

        (name_regex, any::<i64>(), arb_value(), tags).prop_map(|(metric, timestamp, value, tags)| DataPoint {
            timestamp,
            metric,
            value,
            tags,
        })
    }

    proptest! {
        #[test]
        fn encoded_lines_parse_back(points in prop::collection::vec(arb_point(), 1..32)) {
            let manager = BufferManager::unpooled();
            let mut sink = manager.allocate(256);
            for point in &points {
                write_record(&mut sink, false, point.timestamp, &point.metric, point.value, &point.tags);
            }

            let output = std::str::from_utf8(sink.as_bytes()).unwrap();
            let decoded = output.lines().map(|line| line.parse::<DataPoint>().unwrap()).collect::<Vec<_>>();
            prop_assert_eq!(decoded, points);
        }
    }
}
