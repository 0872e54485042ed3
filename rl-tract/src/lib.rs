pub mod config;
pub mod dwi;
pub mod environment;
pub mod sphere;
pub mod state;
pub mod streamline;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let _ = env_logger::builder()
        .format_timestamp_secs()
        .filter_level(log::LevelFilter::Debug)
        .parse_default_env()
        .is_test(true)
        .try_init();
}
