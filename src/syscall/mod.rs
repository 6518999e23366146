/*
 * Port I/O
 *
 * The teacher's SYSCALL/SYSRET dispatcher lived in this module; it is out
 * of the tasking core's scope (the syscall handoff is a collaborator the
 * core only exposes a `SyscallState` field for, never drives itself) and
 * has been trimmed. What remains is the port-I/O primitive pair the
 * serial driver and PIC/PIT programming build on.
 */

pub mod io;
pub mod pio;
