// build.rs

use std::env;

fn main() -> anyhow::Result<()> {
    // Necessary because of this issue: https://github.com/rust-lang/cargo/issues/9641
    // see also https://github.com/rust-lang/cargo/issues/9554
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::build::CfgArgs::output_propagated("ESP_IDF")?;
        embuild::build::LinkArgs::output_propagated("ESP_IDF")?;
    }

    for (key, fallback) in [
        ("WIFI_SSID", "internet"),
        ("WIFI_PASS", "password"),
        ("MQTT_USER", "hassio_mqtt_user"),
        ("MQTT_PASS", "hassio_mqtt_password"),
    ] {
        println!("cargo:rerun-if-env-changed={key}");
        let value = env::var(key).unwrap_or_else(|_| fallback.into());
        println!("cargo:rustc-env={key}={value}");
    }

    Ok(())
}

// EOF
