//! Host tests driving the flash driver against an in-memory firmware double.
//!
//! The mock keeps the firmware's asynchronous contract: a submitted step is
//! only applied to the backing memory at submission time, but its completion
//! callback fires later, from a separate pump thread, the way the real
//! firmware reports completion from radio scheduler context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use blectlr_flash::{AtomicLock, Error, Flash, FlashError, FlashFirmware, RawLock, RetVal};

const PAGE_SIZE: usize = 1024;
const PAGE_COUNT: usize = 8;
const FLASH_SIZE: usize = PAGE_SIZE * PAGE_COUNT;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Write { word_address: u32, bytes: Vec<u8> },
    Erase { page_address: u32 },
}

struct MockFirmware {
    /// Backing memory, initialized to the erased value.
    mem: Mutex<Vec<u8>>,
    calls: Mutex<Vec<Call>>,
    /// Completions not yet delivered to the driver.
    pending: Mutex<usize>,
    reject_submissions: AtomicBool,
}

impl MockFirmware {
    fn new() -> Self {
        Self {
            mem: Mutex::new(vec![0xFF; FLASH_SIZE]),
            calls: Mutex::new(Vec::new()),
            pending: Mutex::new(0),
            reject_submissions: AtomicBool::new(false),
        }
    }

    fn take_pending(&self) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }

    fn has_pending(&self) -> bool {
        *self.pending.lock().unwrap() > 0
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        self.mem.lock().unwrap()[address as usize..address as usize + len].to_vec()
    }
}

impl FlashFirmware for MockFirmware {
    const PAGE_SIZE: usize = PAGE_SIZE;
    const PAGE_COUNT: usize = PAGE_COUNT;

    fn write(&self, word_address: u32, data: *const u32, word_count: u32) -> Result<(), Error> {
        if self.reject_submissions.load(Ordering::Relaxed) {
            return Err(Error::EIO);
        }
        assert_eq!(word_address % 4, 0, "burst address must be word aligned");

        let mut bytes = Vec::with_capacity(word_count as usize * 4);
        for i in 0..word_count as usize {
            let word = unsafe { data.add(i).read_unaligned() };
            bytes.extend_from_slice(&word.to_ne_bytes());
        }

        // NOR programming can only clear bits.
        let mut mem = self.mem.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            mem[word_address as usize + i] &= b;
        }
        drop(mem);

        self.calls.lock().unwrap().push(Call::Write {
            word_address,
            bytes,
        });
        *self.pending.lock().unwrap() += 1;
        Ok(())
    }

    fn erase_page(&self, page_address: u32) -> Result<(), Error> {
        if self.reject_submissions.load(Ordering::Relaxed) {
            return Err(Error::EIO);
        }
        assert_eq!(page_address as usize % PAGE_SIZE, 0);

        let mut mem = self.mem.lock().unwrap();
        mem[page_address as usize..page_address as usize + PAGE_SIZE].fill(0xFF);
        drop(mem);

        self.calls
            .lock()
            .unwrap()
            .push(Call::Erase { page_address });
        *self.pending.lock().unwrap() += 1;
        Ok(())
    }

    fn read(&self, address: u32, buf: &mut [u8]) {
        let mem = self.mem.lock().unwrap();
        buf.copy_from_slice(&mem[address as usize..address as usize + buf.len()]);
    }
}

/// Runs `f` against a fresh driver while a pump thread plays the part of the
/// firmware's completion context.
fn run<R: Send>(
    fw: &MockFirmware,
    api_lock: &AtomicLock,
    f: impl FnOnce(&Flash<'_, MockFirmware, AtomicLock>) -> R + Send,
) -> R {
    let flash = Flash::new(fw, api_lock);
    let stop = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let pump = scope.spawn(|| {
            while !stop.load(Ordering::Acquire) || fw.has_pending() {
                if fw.take_pending() {
                    // The firmware reports completion only after the
                    // submitting call has returned and dropped the shared
                    // API lock; wait for that before delivering.
                    api_lock.acquire();
                    api_lock.release();
                    flash.on_operation_complete(RetVal::SUCCESS);
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let result = f(&flash);
        stop.store(true, Ordering::Release);
        pump.join().unwrap();
        result
    })
}

#[repr(align(4))]
struct Aligned<const N: usize>([u8; N]);

#[test]
fn zero_length_requests_touch_nothing() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        // Even with the shared API held by another subsystem, zero-length
        // requests succeed without a firmware call.
        api.try_acquire().unwrap();
        flash.read(16, &mut []).unwrap();
        flash.write(16, &[]).unwrap();
        flash.erase(0, 0).unwrap();
        api.release();
    });
    assert!(fw.calls().is_empty());
}

#[test]
fn aligned_single_page_write_is_one_burst() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let data = Aligned([0x5A; 64]);
    run(&fw, &api, |flash| flash.write(128, &data.0)).unwrap();

    let calls = fw.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        Call::Write {
            word_address: 128,
            bytes: vec![0x5A; 64],
        }
    );
    assert_eq!(fw.contents(128, 64), vec![0x5A; 64]);
}

#[test]
fn large_write_bursts_one_page_at_a_time() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let data = Aligned([0x33; 2 * PAGE_SIZE + 52]);
    run(&fw, &api, |flash| flash.write(0, &data.0)).unwrap();

    let lens: Vec<usize> = fw
        .calls()
        .iter()
        .map(|c| match c {
            Call::Write { bytes, .. } => bytes.len(),
            Call::Erase { .. } => panic!("unexpected erase"),
        })
        .collect();
    assert_eq!(lens, [PAGE_SIZE, PAGE_SIZE, 52]);
    assert_eq!(fw.contents(0, data.0.len()), data.0);
}

#[test]
fn misaligned_write_reconstructs_input() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let data = Aligned([10, 20, 30, 40, 50]);
    run(&fw, &api, |flash| {
        // Pre-program the neighbours of the target range; the all-ones
        // padding of the masked words must leave them untouched.
        flash.write(0, &[0xAA, 0xBB]).unwrap();
        flash.write(7, &[0xCC]).unwrap();
        flash.write(2, &data.0)
    })
    .unwrap();

    assert_eq!(fw.contents(2, 5), data.0);
    assert_eq!(fw.contents(0, 2), [0xAA, 0xBB]);
    assert_eq!(fw.contents(7, 1), [0xCC]);

    // First step of the 5-byte request: one masked word at address 0
    // carrying input bytes at offsets 2 and 3.
    let calls = fw.calls();
    assert_eq!(
        calls[2],
        Call::Write {
            word_address: 0,
            bytes: vec![0xFF, 0xFF, 10, 20],
        }
    );
    assert!(calls[3..]
        .iter()
        .all(|c| matches!(c, Call::Write { word_address: 4, bytes } if bytes.len() == 4)));
}

#[test]
fn unaligned_offsets_round_trip() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let mut data = Aligned([0; 33]);
    for (i, b) in data.0.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(13).wrapping_add(1);
    }
    run(&fw, &api, |flash| {
        flash.write(7, &data.0[2..28]).unwrap();
        let mut readback = [0u8; 26];
        flash.read(7, &mut readback).unwrap();
        assert_eq!(readback, data.0[2..28]);
    });
}

#[test]
fn out_of_bounds_requests_are_rejected() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        let mut buf = [0u8; 8];
        assert_eq!(
            flash.read(FLASH_SIZE as u32 - 4, &mut buf),
            Err(FlashError::OutOfBounds)
        );
        assert_eq!(
            flash.write(FLASH_SIZE as u32 - 2, &[0; 4]),
            Err(FlashError::OutOfBounds)
        );
        assert_eq!(
            flash.erase(FLASH_SIZE as u32, PAGE_SIZE as u32),
            Err(FlashError::OutOfBounds)
        );
    });
    assert!(fw.calls().is_empty());
}

#[test]
fn erase_validates_alignment_and_page_count() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        assert_eq!(flash.erase(12, PAGE_SIZE as u32), Err(FlashError::Unaligned));
        assert_eq!(flash.erase(0, 100), Err(FlashError::Unaligned));
        assert_eq!(
            flash.erase(0, 2 * PAGE_SIZE as u32),
            Err(FlashError::MultiPageErase)
        );
    });
    assert!(fw.calls().is_empty());
}

#[test]
fn erase_issues_exactly_one_step() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        flash.write(PAGE_SIZE as u32, &[0u8; 16]).unwrap();
        flash.erase(PAGE_SIZE as u32, PAGE_SIZE as u32).unwrap();
    });

    let erase_count = fw
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Erase { page_address } if *page_address as usize == PAGE_SIZE))
        .count();
    assert_eq!(erase_count, 1);
    assert_eq!(fw.contents(PAGE_SIZE as u32, 16), vec![0xFF; 16]);
}

#[test]
fn write_protection_is_a_noop() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        flash.set_write_protection(true).unwrap();
        flash.set_write_protection(false).unwrap();
    });
    assert!(fw.calls().is_empty());
}

#[test]
fn busy_api_lock_fails_first_submission_and_recovers() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        api.try_acquire().unwrap();
        assert_eq!(flash.write(0, &[1, 2, 3, 4]), Err(FlashError::Busy));
        assert_eq!(flash.erase(0, PAGE_SIZE as u32), Err(FlashError::Busy));
        assert!(fw.calls().is_empty());
        api.release();

        // The request lock was released on the error path, so the driver is
        // immediately usable again.
        flash.write(0, &[1, 2, 3, 4]).unwrap();
    });
    assert_eq!(fw.contents(0, 4), [1, 2, 3, 4]);
}

#[test]
fn rejected_first_submission_is_recoverable() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    run(&fw, &api, |flash| {
        fw.reject_submissions.store(true, Ordering::Relaxed);
        assert_eq!(
            flash.write(0, &[1, 2, 3, 4]),
            Err(FlashError::Firmware(Error::EIO))
        );
        assert_eq!(
            flash.erase(0, PAGE_SIZE as u32),
            Err(FlashError::Firmware(Error::EIO))
        );
        fw.reject_submissions.store(false, Ordering::Relaxed);
        flash.write(0, &[1, 2, 3, 4]).unwrap();
    });
    assert_eq!(fw.contents(0, 4), [1, 2, 3, 4]);
}

#[test]
fn busy_api_lock_mid_sequence_reports_busy() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let flash = Flash::new(&fw, &api);
    let data = Aligned([0x22; 9]);

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| flash.write(1, &data.0));
        while !fw.take_pending() {
            std::thread::yield_now();
        }
        // Another subsystem holds the shared API when the first step of the
        // multi-step request completes; the next step cannot be submitted
        // and the blocked caller must get the error instead of wedging.
        api.try_acquire().unwrap();
        flash.on_operation_complete(RetVal::SUCCESS);
        api.release();
        assert_eq!(writer.join().unwrap(), Err(FlashError::Busy));
    });

    // The request was torn down; a retry completes normally.
    run(&fw, &api, |flash| flash.write(1, &data.0)).unwrap();
    assert_eq!(fw.contents(1, 9), data.0);
}

#[test]
fn failed_step_completion_is_reported() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let flash = Flash::new(&fw, &api);
    let data = Aligned([0x11; 8]);

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| flash.write(0, &data.0));
        while !fw.take_pending() {
            std::thread::yield_now();
        }
        flash.on_operation_complete(Error::EIO.to_retval());
        assert_eq!(
            writer.join().unwrap(),
            Err(FlashError::Firmware(Error::EIO))
        );
    });

    // The request was torn down; a new one goes through.
    run(&fw, &api, |flash| flash.write(0, &data.0)).unwrap();
}

#[test]
fn concurrent_writes_are_serialized() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    // Misaligned on purpose: phase-shifted requests decay into many masked
    // single-word steps, maximizing the interleaving window.
    let a = [0x0A; 40];
    let b = [0x0B; 40];

    run(&fw, &api, |flash| {
        std::thread::scope(|scope| {
            let wa = scope.spawn(|| flash.write(1, &a));
            let wb = scope.spawn(|| flash.write(PAGE_SIZE as u32 + 1, &b));
            wa.join().unwrap().unwrap();
            wb.join().unwrap().unwrap();
        });
    });

    assert_eq!(fw.contents(1, 40), a);
    assert_eq!(fw.contents(PAGE_SIZE as u32 + 1, 40), b);

    // All steps of one request must complete before the other's begin.
    let in_first_page: Vec<bool> = fw
        .calls()
        .iter()
        .map(|c| match c {
            Call::Write { word_address, .. } => (*word_address as usize) < PAGE_SIZE,
            Call::Erase { .. } => panic!("unexpected erase"),
        })
        .collect();
    let flips = in_first_page.windows(2).filter(|w| w[0] != w[1]).count();
    assert!(flips <= 1, "steps of the two requests interleaved");
}

#[test]
#[should_panic(expected = "spurious flash completion callback")]
fn spurious_callback_panics() {
    let fw = MockFirmware::new();
    let api = AtomicLock::INIT;
    let flash = Flash::new(&fw, &api);
    flash.on_operation_complete(RetVal::SUCCESS);
}
