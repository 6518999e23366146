/*
 * Peripheral Device Management
 *
 * COM2 serial port and the PIC, the two hardware surfaces the tasking
 * core's ambient logging and timer interrupt depend on.
 */

use spin::Mutex;

use crate::syscall::pio::Pio;

use self::uart_16550::SerialPort;

pub mod pic;
pub mod uart_16550;

/// Mutex-protected static instance of COM2 serial port.
pub static COM2: Mutex<SerialPort<Pio<u8>>> = Mutex::new(SerialPort::<Pio<u8>>::new(0x2F8));

/// Initializes the debug port (COM2) for logging.
///
/// This function should be called early in the boot process before any logging occurs.
pub fn init_debug_port() {
    COM2.lock().init();
}
