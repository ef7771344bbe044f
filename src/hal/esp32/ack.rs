//! Decoder ACK input for DECUP and MDU.
//!
//! The comparator output raises a GPIO interrupt per ACK pulse. The handler
//! only posts the timer value of the edge through an [`isr_channel`]; the
//! task side counts the edges and turns the first one into a delay since the
//! last arm.

use core::cell::{Cell, RefCell};
use core::ffi::c_void;

use esp_idf_hal::gpio::{AnyInputPin, Input, InterruptType, PinDriver, Pull};
use esp_idf_hal::sys::{self, esp, EspError};

use crate::channel::{isr_channel, IsrReceiver, IsrSender};
use crate::traits::AckLine;

/// Edges buffered between two reads, one slot stays free.
const EDGE_SLOTS: usize = 8;

type EdgeSender = IsrSender<u32, EDGE_SLOTS>;
type EdgeReceiver = IsrReceiver<u32, EDGE_SLOTS>;

/// Low 32 bits of the high resolution timer [µs].
fn timer_us() -> u32 {
    // Safe: plain read of the hardware timer
    unsafe { sys::esp_timer_get_time() as u32 }
}

#[link_section = ".iram1.ack_isr"]
unsafe extern "C" fn ack_isr(arg: *mut c_void) {
    // Safe: `arg` is the sender leaked in `Esp32AckLine::new`, used by this
    // handler only
    let edges = &mut *(arg as *mut EdgeSender);
    edges.notify(timer_us());
}

/// ACK comparator input.
pub struct Esp32AckLine<'d> {
    pin: PinDriver<'d, AnyInputPin, Input>,
    sender: *mut EdgeSender,
    edges: RefCell<EdgeReceiver>,
    armed_at: u32,
    count: Cell<u8>,
    first_edge: Cell<Option<u32>>,
}

// Safe: the sender pointer is only dereferenced by the ISR and freed in drop
// after the handler is removed
unsafe impl Send for Esp32AckLine<'_> {}

impl<'d> Esp32AckLine<'d> {
    /// Configures the pin and installs the edge interrupt.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin or the ISR service can't be set up.
    pub fn new(pin: AnyInputPin) -> Result<Self, EspError> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Down)?;
        pin.set_interrupt_type(InterruptType::PosEdge)?;

        let (sender, receiver) = isr_channel::<u32, EDGE_SLOTS>();
        let sender = Box::into_raw(Box::new(sender));

        let gpio = pin.pin();
        // Safe: the handler only touches its own sender, which outlives it
        let installed = unsafe {
            // Already installed by another driver
            let err = sys::gpio_install_isr_service(0);
            let service = if err == sys::ESP_ERR_INVALID_STATE as sys::esp_err_t {
                Ok(())
            } else {
                esp!(err)
            };
            service
                .and_then(|()| esp!(sys::gpio_isr_handler_add(gpio, Some(ack_isr), sender.cast())))
                .and_then(|()| esp!(sys::gpio_intr_enable(gpio)))
        };
        if let Err(e) = installed {
            // Safe: no handler references the sender
            unsafe {
                sys::gpio_isr_handler_remove(gpio);
                drop(Box::from_raw(sender));
            }
            return Err(e);
        }

        Ok(Self {
            pin,
            sender,
            edges: RefCell::new(receiver),
            armed_at: timer_us(),
            count: Cell::new(0),
            first_edge: Cell::new(None),
        })
    }

    /// Folds the edges posted since the last call into count and capture.
    fn collect(&self) {
        let mut edges = self.edges.borrow_mut();
        while let Some(at) = edges.try_take() {
            if self.first_edge.get().is_none() {
                self.first_edge.set(Some(at.wrapping_sub(self.armed_at)));
            }
            self.count.set(self.count.get().saturating_add(1));
        }
    }
}

impl AckLine for Esp32AckLine<'_> {
    type Error = EspError;

    fn arm(&mut self) -> Result<(), EspError> {
        self.edges.get_mut().drain();
        self.armed_at = timer_us();
        self.count.set(0);
        self.first_edge.set(None);
        Ok(())
    }

    fn edge_count(&self) -> u8 {
        self.collect();
        self.count.get()
    }

    fn first_edge_ticks(&self) -> Option<u32> {
        self.collect();
        self.first_edge.get()
    }
}

impl Drop for Esp32AckLine<'_> {
    fn drop(&mut self) {
        // Safe: the handler is gone before its sender is freed
        unsafe {
            sys::gpio_isr_handler_remove(self.pin.pin());
            drop(Box::from_raw(self.sender));
        }
    }
}
