use std::env;

/// Forward an optional build-time variable to the crate, falling back to `default`.
fn forward(name: &str, default: &str, secret: bool) {
    match env::var(name) {
        Ok(value) => {
            println!("cargo:rustc-env={}={}", name, value);
            if secret {
                println!("cargo:warning=Using {} from environment (hidden)", name);
            } else {
                println!("cargo:warning=Using {} from environment: {}", name, value);
            }
        }
        Err(_) => println!("cargo:rustc-env={}={}", name, default),
    }
    println!("cargo:rerun-if-env-changed={}", name);
}

fn main() {
    // Defaults for NodeConfig::from_build_env(). Everything is optional so host
    // builds and tests work without any environment set up.

    // Device identity
    forward("DEVICE_NAME", "fieldlink-node", false);

    // WiFi credentials
    forward("WIFI_SSID", "", false);
    forward("WIFI_PASSWORD", "", true);

    // MQTT broker
    forward("MQTT_HOST", "", false);
    forward("MQTT_PORT", "1883", false);
    forward("MQTT_USER", "", false);
    forward("MQTT_PASSWORD", "", true);

    // Publish device log lines on boards/<device>/log
    forward("MQTT_LOG", "false", false);
}
