pub mod assets;
pub mod config;
pub mod error;
pub mod network;
pub mod packet;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
