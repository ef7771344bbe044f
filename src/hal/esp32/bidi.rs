//! BiDi cutout and UART receiver.
//!
//! The cutout runs entirely in interrupt context. The RMT tx-end callback
//! starts the [`Cutout`] machine and arms a hardware timer alarm. Every alarm
//! steps the machine and re-arms the next one, driving BiDi-enable on the way.
//! The final step posts the [`CutoutFlags`] through an [`isr_channel`], where
//! [`Esp32Bidi::wait_cutout`] picks them up.
//!
//! Alarm values are relative to a base count taken at tx-end. A step that asks
//! for a counter value moves the base instead of writing the counter.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};

use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, InputPin, Output, OutputPin, PinDriver};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::sys::{self, EspError};
use esp_idf_hal::timer::{config::Config as TimerConfig, Timer, TimerDriver};
use esp_idf_hal::uart::{config::Config, Uart, UartDriver};
use esp_idf_hal::units::Hertz;

use super::Esp32Clock;
use crate::bidi::{Cutout, CutoutFlags, CutoutStep, TCE_MIN};
use crate::channel::{isr_channel, IsrReceiver, IsrSender};
use crate::config::CutoutOffsets;
use crate::traits::BidiReceiver;

/// Non-blocking UART read.
const NON_BLOCK: u32 = 0;

/// Timer clock of 80 MHz APB divided down to 1 MHz.
const TIMER_DIVIDER: u32 = 80;

/// Longest wait for the flags of one cutout [µs].
const CUTOUT_WAIT_US: u32 = TCE_MIN as u32 + 500;

/// Flags of cutouts not yet picked up, one slot stays free.
const FLAG_SLOTS: usize = 4;

/// `UART_STATUS_REG` of UART0 to UART2 on the ESP32-S3.
const UART_STATUS_REGS: [usize; 3] = [0x6000_001C, 0x6001_001C, 0x6002_E01C];

/// `UART_RXFIFO_CNT` field of `UART_STATUS_REG`.
const RXFIFO_CNT_MASK: u32 = 0x3FF;

/// State shared by the tx-end and the timer interrupt.
///
/// Both interrupts run on the driver core at the same level and never nest.
struct CutoutIsr {
    cutout: Cutout,
    base: u64,
    alarm: u16,
    armed: AtomicBool,
    rmt_channel: sys::rmt_channel_t,
    group: sys::timer_group_t,
    index: sys::timer_idx_t,
    bidi_en: i32,
    uart_status: *const u32,
    flags: IsrSender<u8, FLAG_SLOTS>,
}

impl CutoutIsr {
    /// Performs the actions of one step.
    ///
    /// # Safety
    ///
    /// Interrupt context only.
    #[link_section = ".iram1.bidi_apply"]
    unsafe fn apply(&mut self, step: CutoutStep) {
        if let Some(count) = step.set_count {
            let now = sys::timer_group_get_counter_value_in_isr(self.group, self.index);
            self.base = now.wrapping_sub(count as u64);
        }
        if let Some(level) = step.bidi_en {
            sys::gpio_set_level(self.bidi_en, level as u32);
        }
        if let Some(alarm) = step.alarm {
            self.alarm = alarm;
            let at = self.base.wrapping_add(alarm as u64);
            sys::timer_group_set_alarm_value_in_isr(self.group, self.index, at);
            sys::timer_group_enable_alarm_in_isr(self.group, self.index);
        }
        if let Some(flags) = step.notify {
            self.flags.notify(flags.bits());
        }
    }

    fn rx_fifo_len(&self) -> usize {
        // Safe: read-only status register of the UART this receiver owns
        let status = unsafe { core::ptr::read_volatile(self.uart_status) };
        (status & RXFIFO_CNT_MASK) as usize
    }
}

#[link_section = ".iram1.bidi_tx_end"]
unsafe extern "C" fn tx_end_isr(channel: sys::rmt_channel_t, arg: *mut c_void) {
    // Safe: `arg` is the state leaked in `Esp32Bidi::new`
    let isr = &mut *(arg as *mut CutoutIsr);
    if channel != isr.rmt_channel || !isr.armed.load(Ordering::Acquire) {
        return;
    }
    let step = isr.cutout.on_tx_done();
    isr.apply(step);
}

/// Moves the state pointer into the timer callback.
struct SharedIsr(*mut CutoutIsr);

// Safe: only interrupt handlers dereference the pointer, see `CutoutIsr`
unsafe impl Send for SharedIsr {}

impl SharedIsr {
    fn get(&self) -> *mut CutoutIsr {
        self.0
    }
}

/// RailCom UART with its BiDi-enable switch and cutout timer.
pub struct Esp32Bidi<'d> {
    uart: UartDriver<'d>,
    bidi_en: PinDriver<'d, AnyOutputPin, Output>,
    timer: TimerDriver<'d>,
    isr: *mut CutoutIsr,
    flags: IsrReceiver<u8, FLAG_SLOTS>,
    enabled: bool,
    clock: Esp32Clock,
}

// Safe: the state pointer is shared with interrupts only, see `CutoutIsr`
unsafe impl Send for Esp32Bidi<'_> {}

impl<'d> Esp32Bidi<'d> {
    /// RailCom bit rate.
    pub const BAUD_RATE: u32 = 250_000;

    /// Creates the receiver, disarmed.
    ///
    /// `rmt_channel` is the channel of the track transmitter whose packets
    /// are followed by a cutout.
    ///
    /// # Errors
    ///
    /// Returns an error if the UART, the timer or the enable pin can't be
    /// configured.
    pub fn new<U: Uart, T: Timer>(
        uart: impl Peripheral<P = U> + 'd,
        rx: impl Peripheral<P = impl InputPin + OutputPin> + 'd,
        bidi_en: AnyOutputPin,
        timer: impl Peripheral<P = T> + 'd,
        rmt_channel: sys::rmt_channel_t,
        offsets: CutoutOffsets,
    ) -> Result<Self, EspError> {
        let config = Config::new().baudrate(Hertz(Self::BAUD_RATE));
        let uart = UartDriver::new(
            uart,
            AnyIOPin::none(),
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &config,
        )?;
        let mut bidi_en = PinDriver::output(bidi_en)?;
        bidi_en.set_low()?;

        let mut timer = TimerDriver::new(
            timer,
            &TimerConfig::new().divider(TIMER_DIVIDER).auto_reload(false),
        )?;

        let (sender, flags) = isr_channel::<u8, FLAG_SLOTS>();
        let isr = Box::into_raw(Box::new(CutoutIsr {
            cutout: Cutout::new(offsets),
            base: 0,
            alarm: 0,
            armed: AtomicBool::new(false),
            rmt_channel,
            group: T::group(),
            index: T::index(),
            bidi_en: bidi_en.pin(),
            uart_status: UART_STATUS_REGS[U::port() as usize] as *const u32,
            flags: sender,
        }));

        let shared = SharedIsr(isr);
        // Safe: the callback only touches the leaked state, which is freed in
        // drop after the callback is gone
        let installed = unsafe {
            timer.subscribe(move || {
                let isr = &mut *shared.get();
                let step = isr.cutout.on_alarm(isr.alarm, isr.rx_fifo_len());
                isr.apply(step);
            })
        }
        .and_then(|()| timer.enable_interrupt())
        .and_then(|()| timer.enable_alarm(false))
        .and_then(|()| timer.enable(true));
        if let Err(e) = installed {
            let _ = timer.unsubscribe();
            // Safe: no callback references the state
            unsafe { drop(Box::from_raw(isr)) };
            return Err(e);
        }

        // Safe: the tx-end callback is unregistered before the state is freed
        unsafe {
            sys::rmt_register_tx_end_callback(Some(tx_end_isr), isr.cast());
        }

        Ok(Self {
            uart,
            bidi_en,
            timer,
            isr,
            flags,
            enabled: false,
            clock: Esp32Clock::new(),
        })
    }

    fn armed(&self) -> &AtomicBool {
        // Safe: `armed` is atomic, the rest of the state is left to interrupts
        unsafe { &(*self.isr).armed }
    }
}

impl BidiReceiver for Esp32Bidi<'_> {
    type Error = EspError;

    fn set_enabled(&mut self, enabled: bool) -> Result<(), EspError> {
        self.enabled = enabled;
        self.armed().store(enabled, Ordering::Release);
        if !enabled {
            self.timer.enable_alarm(false)?;
            self.bidi_en.set_low()?;
            self.flags.drain();
        }
        Ok(())
    }

    fn wait_cutout(&mut self) -> Result<CutoutFlags, EspError> {
        if !self.enabled {
            return Ok(CutoutFlags::default());
        }
        let flags = self.flags.take_within(&self.clock, CUTOUT_WAIT_US);
        if flags.is_none() {
            log::warn!("No cutout after transmission");
        }
        Ok(flags.map(CutoutFlags::from_bits).unwrap_or_default())
    }

    fn available(&mut self) -> Result<usize, EspError> {
        self.uart.remaining_read()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, EspError> {
        self.uart.read(buf, NON_BLOCK)
    }

    fn flush(&mut self) -> Result<(), EspError> {
        self.uart.clear_rx()
    }
}

impl Drop for Esp32Bidi<'_> {
    fn drop(&mut self) {
        self.armed().store(false, Ordering::Release);
        let _ = self.timer.enable_alarm(false);
        let _ = self.timer.unsubscribe();
        // Safe: both interrupts are gone before the state is freed
        unsafe {
            sys::rmt_register_tx_end_callback(None, core::ptr::null_mut());
            drop(Box::from_raw(self.isr));
        }
    }
}
