/// Top-level configuration for the engine.
///
/// # Examples
///
/// ```
/// let _config = deltastore::Config::default()
///     .total_memory(256 * 1024 * 1024)
///     .hash_capacity(1 << 20)
///     .gc_every_ms(Some(1000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub(crate) total_memory: usize,
    pub(crate) page_size: usize,
    pub(crate) hash_capacity: usize,
    pub(crate) gc_every_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            total_memory: 256 * 1024 * 1024,
            page_size: 2 * 1024 * 1024,
            hash_capacity: 1 << 20,
            gc_every_ms: None,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc = "Builder, sets "]
            #[doc = $desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    };
}

impl Config {
    builder!(
        (
            total_memory,
            usize,
            "the size in bytes of the page arena backing all tables"
        ),
        (
            page_size,
            usize,
            "the size in bytes of a single page (main tier and log)"
        ),
        (
            hash_capacity,
            usize,
            "the number of slots in each table's hash table, rounded up to a power of two"
        ),
        (
            gc_every_ms,
            Option<u64>,
            "the interval of the background garbage collection thread, or None to only collect on demand"
        )
    );
}
