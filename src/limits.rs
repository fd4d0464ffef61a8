// Hard limits on inputs and in-memory growth.

pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_METHOD_LEN: usize = 64;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_WINDOWS_PER_MENTOR: usize = 7 * 48;
/// Cap on slots a mentor can hold at once. Cancelled history does not count.
pub const MAX_LIVE_BOOKINGS_PER_MENTOR: usize = 100_000;
pub const MAX_SESSION_DURATION_MIN: u32 = 24 * 60;
/// Distinct accounts one connection may subscribe to.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 16;
/// Longest accepted wire request line in bytes.
pub const MAX_LINE_LEN: usize = 64 * 1024;
