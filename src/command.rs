use crate::config::InterfacesConfig;

const SYSFS_NET: &str = "/sys/class/net";

/// Shell command that prints one JSON object per host:
/// `{"uptime": "<uptime output>", "<iface>": <rx_bytes + tx_bytes>, ...}`.
///
/// Interfaces are emitted in sorted order. A counter that cannot be read
/// (interface missing on that host) contributes 0.
pub fn build_command(interfaces: &InterfacesConfig) -> String {
    let mut fields = vec![r#"\"uptime\": \"$(uptime)\""#.to_string()];
    for iface in interfaces.all() {
        fields.push(format!(
            r#"\"{iface}\": $(( {rx} + {tx} ))"#,
            rx = read_counter(iface, "rx_bytes"),
            tx = read_counter(iface, "tx_bytes"),
        ));
    }
    format!(r#"echo "{{{}}}""#, fields.join(", "))
}

fn read_counter(iface: &str, counter: &str) -> String {
    format!("$(cat {SYSFS_NET}/{iface}/statistics/{counter} 2>/dev/null || echo 0)")
}
