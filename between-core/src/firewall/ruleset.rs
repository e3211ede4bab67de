//! pf ruleset rendering.
//!
//! The template redirects outbound TCP 80/443 on one interface to the two
//! local proxy ports. pf can only translate inbound packets, so outgoing
//! packets are first routed to `lo0`, where the `rdr` rules see them as
//! inbound. Packets owned by the proxy user skip the `route-to` rule, which
//! keeps the proxy's own upstream connections from looping back into itself.

use crate::config::RedirectConfig;

const RULESET_TEMPLATE: &str = r#"Interface = {interface}
Proxy_User = {proxy_user}
Proxy_IP = {proxy_address}
Proxy_Http_Port = {http_port}
Proxy_Https_Port = {https_port}

# Intercept http/https packets
Filter = "proto tcp from " $Interface " to any port { 80, 443 }"
Http_Filter = "proto tcp from " $Interface " to any port 80"
Https_Filter = "proto tcp from " $Interface " to any port 443"

# Forward intercepted packets to the proxy
rdr pass log on lo0 $Http_Filter -> $Proxy_IP port $Proxy_Http_Port
rdr pass log on lo0 $Https_Filter -> $Proxy_IP port $Proxy_Https_Port

# Route outgoing packets to loopback so the rdr rules apply
# Skip packets owned by the proxy user to avoid a routing loop
pass out on $Interface route-to lo0 inet $Filter user != $Proxy_User keep state
"#;

/// Render the complete ruleset for `config`.
pub fn render_ruleset(config: &RedirectConfig) -> String {
    RULESET_TEMPLATE
        .replace("{interface}", &config.interface_name)
        .replace("{proxy_user}", &config.proxy_user)
        .replace("{proxy_address}", &config.proxy_address.to_string())
        .replace("{http_port}", &config.proxy_http_port.to_string())
        .replace("{https_port}", &config.proxy_https_port.to_string())
}
