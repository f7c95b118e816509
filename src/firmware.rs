//! Contract for the controller firmware's flash entry points.
//!
//! The physical write and erase sequences are owned by the controller
//! firmware, which schedules them between radio events. This module only
//! defines the call surface the driver needs; the firmware binding layer
//! (FFI or a test double) supplies the implementation.

use crate::error::Error;

/// The asynchronous flash-programming surface of the controller firmware.
///
/// `write` and `erase_page` submit one physical operation each. On a
/// successful submission the firmware performs the operation at a time of its
/// choosing and then invokes the driver's completion callback
/// ([`Flash::on_operation_complete`](crate::Flash::on_operation_complete))
/// exactly once, from an arbitrary execution context (interrupt or thread),
/// strictly after the submitting call has returned.
///
/// Implementations must be callable from both thread and interrupt context;
/// the driver wraps every call in the shared API lock it was constructed
/// with, so implementations see at most one call at a time from this driver.
pub trait FlashFirmware {
    /// Size in bytes of one physical flash page.
    const PAGE_SIZE: usize;
    /// Number of pages in the addressable flash region.
    const PAGE_COUNT: usize;

    /// Programs `word_count` 32-bit words starting at `word_address`.
    ///
    /// `word_address` is word aligned. `data` must stay valid and unmodified
    /// until the completion callback fires; the driver guarantees this for
    /// the pointers it submits.
    fn write(&self, word_address: u32, data: *const u32, word_count: u32) -> Result<(), Error>;

    /// Erases exactly one page starting at `page_address` (page aligned).
    fn erase_page(&self, page_address: u32) -> Result<(), Error>;

    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// Flash is memory mapped and readable without firmware mediation, so
    /// this is an ordinary memory copy on real hardware and never takes the
    /// shared API lock.
    fn read(&self, address: u32, buf: &mut [u8]);
}
