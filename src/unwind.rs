//! Frame-pointer stack capture for the sample handler.
//!
//! Everything here runs on an asynchronous signal context, so the walkers
//! touch nothing but the stack memory they validate and never allocate.

/// Upper bound on frames captured for one sample.
pub const MAX_FRAMES: usize = 100;

// Frame pointers below the first page or above the canonical user-space
// limit are garbage left over from leaf frames or foreign code.
const FP_MIN: usize = 0x1000;
const FP_MAX: usize = 0x7fff_ffff_ffff;

/// Captures the interrupted thread's stack from the machine context saved by
/// the kernel: the interrupted PC first, then the return addresses along the
/// frame-pointer chain. Returns the number of frames stored, never more than
/// `frames.len()`.
pub fn capture_from_context(context: &libc::ucontext_t, frames: &mut [u64]) -> usize {
    let (pc, fp) = context_registers(context);

    let mut depth = 0;
    if pc != 0 && depth < frames.len() {
        frames[depth] = pc;
        depth += 1;
    }

    walk_frame_chain(fp as *const usize, frames, depth, 0)
}

/// Walks the calling thread's own stack, discarding `skip` leading frames.
/// The counter-overflow path passes 6 to drop the signal trampoline and
/// overflow-dispatch frames above the interrupted code.
#[cfg(target_arch = "x86_64")]
pub fn capture_fast(skip: usize, frames: &mut [u64]) -> usize {
    let fp: *const usize;
    // SAFETY: reads the frame-pointer register, nothing else.
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags))
    };
    walk_frame_chain(fp, frames, 0, skip)
}

/// Fast tracing needs the frame-pointer register read; on other targets the
/// context walker is the only capture path.
#[cfg(not(target_arch = "x86_64"))]
pub fn capture_fast(_skip: usize, _frames: &mut [u64]) -> usize {
    0
}

#[cfg(target_arch = "x86_64")]
fn context_registers(context: &libc::ucontext_t) -> (u64, u64) {
    let gregs = &context.uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as u64,
        gregs[libc::REG_RBP as usize] as u64,
    )
}

#[cfg(target_arch = "aarch64")]
fn context_registers(context: &libc::ucontext_t) -> (u64, u64) {
    // x29 is the AAPCS64 frame pointer.
    (context.uc_mcontext.pc, context.uc_mcontext.regs[29])
}

/// Follows saved frame pointers, appending return addresses to `frames`
/// starting at `depth`. Stops on a null, misaligned, out-of-range or
/// non-increasing pointer, or when `frames` is full.
fn walk_frame_chain(
    start: *const usize,
    frames: &mut [u64],
    mut depth: usize,
    mut skip: usize,
) -> usize {
    let mut fp = start;

    while !fp.is_null() && depth < frames.len() {
        if (fp as usize) & 0x7 != 0 {
            break;
        }
        if !(FP_MIN..=FP_MAX).contains(&(fp as usize)) {
            break;
        }

        // SAFETY: the pointer passed the alignment and range checks above;
        // the return address slot sits one word above the saved frame
        // pointer.
        let return_address = unsafe { *fp.add(1) };
        if return_address == 0 {
            break;
        }

        if skip > 0 {
            skip -= 1;
        } else {
            frames[depth] = return_address as u64;
            depth += 1;
        }

        // SAFETY: same validated pointer.
        let next = unsafe { *fp } as *const usize;
        if next <= fp {
            break;
        }
        fp = next;
    }

    depth
}
