use std::io::Write;

/// Install a colored, millisecond timestamped logger reading `RUST_LOG`. Meant for binaries and
/// tests, the library itself never calls it. Calling it twice is harmless.
pub fn setup_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());

            writeln!(
                buf,
                "{} - [{level_style}{:5}{level_style:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Always);

    let _ = builder.try_init();
}
