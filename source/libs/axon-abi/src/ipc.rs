// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-side IPC helpers built over the two rendezvous syscalls.
//!
//! The kernel only offers a non-blocking send; these wrappers add the retry loop
//! every user domain would otherwise repeat.

use crate::{layout, EnvId, ErrorCode, Prot, Syscall};

/// Result of a completed receive, read back from the receiver's mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Sender of the value.
    pub from: EnvId,
    /// Word sent alongside the optional page.
    pub value: u32,
    /// Permission the page was mapped with, empty when no page was transferred.
    pub perm: Prot,
    /// Bytes the sender asked to transfer, clipped to the receiver's limit.
    pub size: usize,
}

/// Entry point into the kernel as seen from a user domain.
pub trait Gate {
    /// Issues `call` with up to six argument words and returns the result word.
    fn call(&mut self, call: Syscall, args: [usize; 6]) -> isize;

    /// Reads the mailbox fields published by the last completed receive.
    fn inbox(&self) -> Delivery;
}

/// Sends `value` (and optionally the page at `page`) to `to`, yielding until the
/// target is blocked in receive.
///
/// Pass `None` to send no page. Errors other than "not receiving" end the loop.
pub fn ipc_send<G: Gate>(
    gate: &mut G,
    to: EnvId,
    value: u32,
    page: Option<(usize, usize, Prot)>,
) -> Result<(), ErrorCode> {
    let (srcva, size, perm) = match page {
        Some(p) => p,
        None => (layout::MAX_USER_ADDRESS, 0, Prot::empty()),
    };
    loop {
        let word = gate.call(
            Syscall::IpcTrySend,
            [to.as_raw() as usize, value as usize, srcva, size, perm.bits() as usize, 0],
        );
        match ErrorCode::decode(word) {
            Ok(_) => return Ok(()),
            Err(ErrorCode::IpcNotReceiving) => {
                gate.call(Syscall::Yield, [0; 6]);
            }
            Err(code) => return Err(code),
        }
    }
}

/// Blocks until a sender delivers, accepting at most `maxsize` bytes at `dstva`.
///
/// `None` declines any page transfer.
pub fn ipc_recv<G: Gate>(gate: &mut G, dst: Option<(usize, usize)>) -> Result<Delivery, ErrorCode> {
    let (dstva, maxsize) = match dst {
        Some(d) => d,
        None => (layout::MAX_USER_ADDRESS, 0),
    };
    let word = gate.call(Syscall::IpcRecv, [dstva, maxsize, 0, 0, 0, 0]);
    ErrorCode::decode(word)?;
    Ok(gate.inbox())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        replies: Vec<isize>,
        calls: Vec<(Syscall, [usize; 6])>,
    }

    impl Gate for Scripted {
        fn call(&mut self, call: Syscall, args: [usize; 6]) -> isize {
            self.calls.push((call, args));
            if call == Syscall::Yield {
                return 0;
            }
            self.replies.remove(0)
        }

        fn inbox(&self) -> Delivery {
            Delivery { from: EnvId::new(1, 1), value: 9, perm: Prot::empty(), size: 0 }
        }
    }

    #[test]
    fn send_retries_until_receiver_ready() {
        let mut gate = Scripted { replies: vec![-6, -6, 0], calls: Vec::new() };
        ipc_send(&mut gate, EnvId::new(2, 1), 7, None).unwrap();
        let sends = gate.calls.iter().filter(|(c, _)| *c == Syscall::IpcTrySend).count();
        let yields = gate.calls.iter().filter(|(c, _)| *c == Syscall::Yield).count();
        assert_eq!((sends, yields), (3, 2));
        assert_eq!(gate.calls[0].1[2], layout::MAX_USER_ADDRESS);
    }

    #[test]
    fn send_stops_on_hard_error() {
        let mut gate = Scripted { replies: vec![-2], calls: Vec::new() };
        assert_eq!(ipc_send(&mut gate, EnvId::new(2, 1), 7, None), Err(ErrorCode::BadEnvironment));
    }

    #[test]
    fn recv_reads_inbox() {
        let mut gate = Scripted { replies: vec![0], calls: Vec::new() };
        let got = ipc_recv(&mut gate, None).unwrap();
        assert_eq!(got.value, 9);
    }
}
