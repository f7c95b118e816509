//! Flash operations scheduled through the controller firmware.
//!
//! Writes and erases cannot touch the flash peripheral directly while the
//! radio is active, so each request is broken into physical steps that the
//! firmware runs between radio events. The driver submits one step at a time
//! and advances from the firmware's completion callback until the request is
//! fully consumed; the submitting caller blocks until then.

use core::cell::RefCell;
use core::slice;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use crate::error::{Error, RetVal};
use crate::firmware::FlashFirmware;
use crate::lock::RawLock;

const WORD_SIZE: usize = 4;

/// Error type for flash operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// An error reported by the controller firmware.
    Firmware(Error),
    /// The operation tried to access an address outside of the flash region.
    OutOfBounds,
    /// The erase address or length is not page aligned.
    Unaligned,
    /// The erase length covers more than one page, which the firmware cannot
    /// do in a single request.
    MultiPageErase,
    /// The shared firmware API is in use by another subsystem.
    Busy,
}

impl From<Error> for FlashError {
    fn from(e: Error) -> Self {
        Self::Firmware(e)
    }
}

/// Driver for the flash region shared with the BLE controller.
///
/// Requests are fully serialized: a second read, write or erase issued while
/// one is in flight blocks until the prior request's whole multi-step
/// sequence has completed. There is no queuing and no cancellation.
///
/// The firmware binding layer must route the firmware's flash completion
/// callback to [`Flash::on_operation_complete`] on the same instance.
pub struct Flash<'d, F: FlashFirmware, L: RawLock> {
    firmware: &'d F,
    /// Serializes individual calls into the shared firmware API.
    api_lock: &'d L,
    /// Serializes whole requests; held for the full multi-step duration.
    request_lock: L,
    /// Completion gate the facade blocks on; signalled by the callback.
    op_done: L,
    state: Mutex<CriticalSectionRawMutex, RefCell<FlashState>>,
}

struct FlashState {
    op: FlashOp,
    /// Staging word for masked sub-word writes. Unwritten bits are held at
    /// all-ones, since flash bits can only go from erased (1) to
    /// programmed (0).
    scratch: u32,
    result: Option<Result<(), FlashError>>,
}

/// The request in flight.
///
/// NOTE: Read is not async, so not a part of this enum.
enum FlashOp {
    None,
    Write {
        /// Absolute byte address of the next unwritten byte.
        address: u32,
        /// Next unconsumed byte of the caller's buffer.
        src: *const u8,
        /// Bytes not yet submitted to the firmware.
        remaining: usize,
        /// Bytes consumed by the most recently submitted step.
        last_len: usize,
    },
    Erase,
}

// Safety: `src` points into the caller's buffer, which the blocking facade
// keeps borrowed until the whole operation has completed.
unsafe impl Send for FlashState {}

/// One firmware write submission.
struct StepCmd {
    word_address: u32,
    data: *const u32,
    word_count: u32,
}

/// One hardware-legal physical step of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// A multi-word program taken directly from the caller's buffer.
    Burst {
        word_address: u32,
        word_count: u32,
        consumed: usize,
    },
    /// A single masked word write. Bytes outside the consumed range are held
    /// at the erased value so already-programmed neighbours are untouched.
    Masked {
        word_address: u32,
        pattern: u32,
        consumed: usize,
    },
}

/// Decides the next physical step for a write at `address` with `data` left
/// to submit.
///
/// The flash is programmed in whole 32-bit words. A burst is only legal when
/// both the flash address and the source pointer are word aligned; anything
/// else goes through a masked single-word write whose consumed length covers
/// the leading misaligned bytes.
fn plan_step(address: u32, data: &[u8], page_size: usize) -> Step {
    let addr_mis = address as usize % WORD_SIZE;
    let data_mis = data.as_ptr() as usize % WORD_SIZE;

    if addr_mis == 0 && data_mis == 0 && data.len() >= WORD_SIZE {
        // Burst programming must not straddle a page in one call; cap the
        // step at one page worth of words.
        let len = (data.len() & !(WORD_SIZE - 1)).min(page_size);
        Step::Burst {
            word_address: address,
            word_count: (len / WORD_SIZE) as u32,
            consumed: len,
        }
    } else {
        let gap = (WORD_SIZE - addr_mis.max(data_mis)).min(data.len());
        let mut word = [0xFF; WORD_SIZE];
        word[addr_mis..addr_mis + gap].copy_from_slice(&data[..gap]);
        Step::Masked {
            word_address: address & !(WORD_SIZE as u32 - 1),
            pattern: u32::from_ne_bytes(word),
            consumed: gap,
        }
    }
}

/// Plans and records the next write step, or `None` when the request is
/// fully consumed (or is not a write).
fn next_write_step(s: &mut FlashState, page_size: usize) -> Option<StepCmd> {
    let FlashOp::Write {
        address,
        src,
        remaining,
        last_len,
    } = &mut s.op
    else {
        return None;
    };
    if *remaining == 0 {
        return None;
    }

    // Safety: the facade keeps the caller's buffer borrowed while the
    // operation is in flight.
    let data = unsafe { slice::from_raw_parts(*src, *remaining) };
    match plan_step(*address, data, page_size) {
        Step::Burst {
            word_address,
            word_count,
            consumed,
        } => {
            *last_len = consumed;
            Some(StepCmd {
                word_address,
                data: (*src).cast(),
                word_count,
            })
        }
        Step::Masked {
            word_address,
            pattern,
            consumed,
        } => {
            *last_len = consumed;
            s.scratch = pattern;
            Some(StepCmd {
                word_address,
                data: core::ptr::from_ref(&s.scratch),
                word_count: 1,
            })
        }
    }
}

impl<'d, F: FlashFirmware, L: RawLock> Flash<'d, F, L> {
    const SIZE: usize = F::PAGE_SIZE * F::PAGE_COUNT;

    /// Creates a new `Flash` driver on top of the firmware's flash entry
    /// points.
    ///
    /// `api_lock` is the lock shared by every caller of the firmware API,
    /// including unrelated subsystems such as radio control; the driver
    /// acquires it around each individual firmware call.
    pub fn new(firmware: &'d F, api_lock: &'d L) -> Self {
        Self {
            firmware,
            api_lock,
            request_lock: L::INIT,
            op_done: L::INIT,
            state: Mutex::new(RefCell::new(FlashState {
                op: FlashOp::None,
                scratch: 0,
                result: None,
            })),
        }
    }

    /// Total size of the flash region in bytes.
    pub const fn capacity() -> usize {
        Self::SIZE
    }

    /// Size of one physical page in bytes.
    pub const fn page_size() -> usize {
        F::PAGE_SIZE
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FlashState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    fn is_addr_valid(offset: u32, len: usize) -> bool {
        offset as u64 + len as u64 <= Self::SIZE as u64
    }

    fn is_page_aligned(value: u32) -> bool {
        value as usize % F::PAGE_SIZE == 0
    }

    /// Runs one call into the shared firmware API under the API lock.
    fn api_call(&self, f: impl FnOnce() -> Result<(), Error>) -> Result<(), FlashError> {
        self.api_lock.try_acquire().map_err(|_| FlashError::Busy)?;
        let ret = f();
        self.api_lock.release();
        ret.map_err(FlashError::Firmware)
    }

    fn submit(&self, cmd: &StepCmd) -> Result<(), FlashError> {
        trace!(
            "flash step: word addr {:#x}, {} words",
            cmd.word_address,
            cmd.word_count
        );
        self.api_call(|| self.firmware.write(cmd.word_address, cmd.data, cmd.word_count))
    }

    /// Unwinds a request whose first submission failed.
    fn abort_request(&self) {
        self.with_state(|s| s.op = FlashOp::None);
        self.op_done.release();
        self.request_lock.release();
    }

    /// Blocks until the callback signals completion, then returns the
    /// recorded result and releases the request lock.
    fn wait_done(&self) -> Result<(), FlashError> {
        let result = loop {
            self.op_done.acquire();
            match self.with_state(|s| s.result.take()) {
                Some(result) => break result,
                // Not signalled yet. Only reachable with a no-op lock, where
                // acquisition cannot wait; poll until the callback has run.
                None => self.op_done.release(),
            }
        };
        self.op_done.release();
        self.request_lock.release();
        result
    }

    /// Reads `bytes.len()` bytes starting at `offset`.
    ///
    /// Flash is memory mapped, so this is a synchronous copy; it only waits
    /// for any in-flight write or erase to finish first.
    pub fn read(&self, offset: u32, bytes: &mut [u8]) -> Result<(), FlashError> {
        if !Self::is_addr_valid(offset, bytes.len()) {
            return Err(FlashError::OutOfBounds);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        self.request_lock.acquire();
        self.firmware.read(offset, bytes);
        self.request_lock.release();
        Ok(())
    }

    /// Writes `data` starting at byte `offset`.
    ///
    /// Neither `offset` nor the buffer need any particular alignment;
    /// misaligned portions are programmed as masked word writes. Returns once
    /// every step of the request has durably completed.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if !Self::is_addr_valid(offset, data.len()) {
            return Err(FlashError::OutOfBounds);
        }
        if data.is_empty() {
            return Ok(());
        }

        self.request_lock.acquire();
        self.op_done.acquire();
        debug!("flash write: addr {:#x}, len {}", offset, data.len());

        let cmd = self.with_state(|s| {
            assert!(matches!(s.op, FlashOp::None));
            s.result = None;
            s.op = FlashOp::Write {
                address: offset,
                src: data.as_ptr(),
                remaining: data.len(),
                last_len: 0,
            };
            unwrap!(next_write_step(s, F::PAGE_SIZE))
        });

        if let Err(e) = self.submit(&cmd) {
            self.abort_request();
            return Err(e);
        }

        self.wait_done()
    }

    /// Erases the pages covering `offset..offset + len`.
    ///
    /// Both `offset` and `len` must be page aligned, and at most one page can
    /// be erased per request. Returns once the erase has durably completed.
    pub fn erase(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        if !Self::is_page_aligned(offset) || !Self::is_page_aligned(len) {
            return Err(FlashError::Unaligned);
        }
        if !Self::is_addr_valid(offset, len as usize) {
            return Err(FlashError::OutOfBounds);
        }

        let page_count = len as usize / F::PAGE_SIZE;
        if page_count > 1 {
            return Err(FlashError::MultiPageErase);
        }
        if page_count == 0 {
            return Ok(());
        }

        self.request_lock.acquire();
        self.op_done.acquire();
        debug!("flash erase: page addr {:#x}", offset);

        self.with_state(|s| {
            assert!(matches!(s.op, FlashOp::None));
            s.result = None;
            s.op = FlashOp::Erase;
        });

        if let Err(e) = self.api_call(|| self.firmware.erase_page(offset)) {
            self.abort_request();
            return Err(e);
        }

        self.wait_done()
    }

    /// The controller firmware manages write protection automatically.
    pub fn set_write_protection(&self, _enable: bool) -> Result<(), FlashError> {
        Ok(())
    }

    /// Completion callback for one physical flash step.
    ///
    /// The firmware binding layer must invoke this exactly once per submitted
    /// step, after the submitting call has returned. It may be invoked from
    /// any execution context, including interrupt handlers; it never blocks.
    ///
    /// If the shared API lock is contended when a continuation step is
    /// submitted, the request ends and the blocked caller gets
    /// [`FlashError::Busy`]; the lock belongs to the whole firmware API and
    /// another subsystem may legitimately hold it at completion time.
    ///
    /// # Panics
    ///
    /// Panics if no operation is in flight, or if the firmware itself rejects
    /// a continuation step (all legality checks were performed before the
    /// first step, so either indicates a bug).
    pub fn on_operation_complete(&self, status: RetVal) {
        enum Advance {
            Done,
            Next(StepCmd),
        }

        let advance = self.with_state(|s| {
            assert!(
                !matches!(s.op, FlashOp::None),
                "spurious flash completion callback"
            );

            if let Err(e) = status.to_result() {
                s.op = FlashOp::None;
                s.result = Some(Err(FlashError::Firmware(e)));
                return Advance::Done;
            }

            if let FlashOp::Write {
                address,
                src,
                remaining,
                last_len,
            } = &mut s.op
            {
                *address += *last_len as u32;
                // Safety: `last_len` never exceeds `remaining`, so this stays
                // within the caller's buffer.
                *src = unsafe { src.add(*last_len) };
                *remaining -= *last_len;
                *last_len = 0;
            }

            match next_write_step(s, F::PAGE_SIZE) {
                Some(cmd) => Advance::Next(cmd),
                None => {
                    s.op = FlashOp::None;
                    s.result = Some(Ok(()));
                    Advance::Done
                }
            }
        });

        match advance {
            Advance::Done => {
                debug!("flash operation complete");
                self.op_done.release();
            }
            Advance::Next(cmd) => match self.submit(&cmd) {
                Ok(()) => {}
                Err(FlashError::Busy) => {
                    // Contention on the shared API is an ordinary condition;
                    // tear the request down and report it to the caller.
                    self.with_state(|s| {
                        s.op = FlashOp::None;
                        s.result = Some(Err(FlashError::Busy));
                    });
                    self.op_done.release();
                }
                // Inputs were validated before the first step; a firmware
                // rejection here is a bug, not a transient condition.
                ret => unwrap!(ret, "flash step rejected mid-sequence"),
            },
        }
    }
}

impl<F: FlashFirmware, L: RawLock> ErrorType for Flash<'_, F, L> {
    type Error = FlashError;
}

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Firmware(_) | Self::Busy | Self::MultiPageErase => NorFlashErrorKind::Other,
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::Unaligned => NorFlashErrorKind::NotAligned,
        }
    }
}

impl<F: FlashFirmware, L: RawLock> ReadNorFlash for Flash<'_, F, L> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        Self::read(self, offset, bytes)
    }

    fn capacity(&self) -> usize {
        Self::SIZE
    }
}

impl<F: FlashFirmware, L: RawLock> NorFlash for Flash<'_, F, L> {
    // Masked word writes give byte granularity.
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = F::PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from {
            return Err(FlashError::OutOfBounds);
        }
        Self::erase(self, from, to - from)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        Self::write(self, offset, bytes)
    }
}

impl<F: FlashFirmware, L: RawLock> MultiwriteNorFlash for Flash<'_, F, L> {}
