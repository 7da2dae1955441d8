//! Build script for compile-time configuration injection.
//!
//! Set environment variables before building the firmware:
//!
//!   GATEKEEPER_SSID=MyWiFi \
//!   GATEKEEPER_PASSWORD=secret123 \
//!   GATEKEEPER_RELAY_HOST=192.168.1.68 \
//!   GATEKEEPER_RELAY_PORT=8080 \
//!   GATEKEEPER_BOT_TOKEN=123456:ABC \
//!   GATEKEEPER_ADMINS=12345678,87654321 \
//!   cargo build --release --features esp32

fn main() {
    // Re-run build script if these environment variables change
    println!("cargo::rerun-if-env-changed=GATEKEEPER_SSID");
    println!("cargo::rerun-if-env-changed=GATEKEEPER_PASSWORD");
    println!("cargo::rerun-if-env-changed=GATEKEEPER_RELAY_HOST");
    println!("cargo::rerun-if-env-changed=GATEKEEPER_RELAY_PORT");
    println!("cargo::rerun-if-env-changed=GATEKEEPER_BOT_TOKEN");
    println!("cargo::rerun-if-env-changed=GATEKEEPER_ADMINS");
}
