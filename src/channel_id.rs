use rand::{Rng, distributions::Alphanumeric};

/// Generates channel ids and temporary references.
///
/// Ids are random alphanumeric strings. They only have to be unique within
/// one physical connection, so the generator does not coordinate with the
/// peer; the session re-draws on the rare collision with a live entry.
#[derive(Debug, Clone)]
pub struct ChannelIdGenerator {
    len: usize,
}

impl ChannelIdGenerator {
    pub const MAX_DRAWS: usize = 64;

    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn id_len(&self) -> usize {
        self.len
    }

    pub fn next(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.len)
            .map(char::from)
            .collect()
    }

    /// Draws ids until `is_taken` reports one as free, giving up after
    /// [`Self::MAX_DRAWS`] collisions.
    pub fn next_unused(&self, is_taken: impl Fn(&str) -> bool) -> Option<String> {
        for _ in 0..Self::MAX_DRAWS {
            let id = self.next();
            if !is_taken(&id) {
                return Some(id);
            }
            tracing::debug!(%id, "channel id collision, drawing again");
        }
        tracing::error!(len = self.len, draws = Self::MAX_DRAWS, "channel id space exhausted");
        None
    }
}
