fn main() {
    // Only the ESP-IDF toolchain exports the sysenv vars embuild forwards
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
