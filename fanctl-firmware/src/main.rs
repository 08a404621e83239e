//
// fanctl firmware for fan and heater controllers
// Copyright (C) 2022 Sebastian Urban <surban@surban.net>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//

//! fanctl Firmware.

#![no_std]
#![no_main]

mod adc;
mod board;
mod boards;
mod console;
mod i2c_master;
mod pwm;
mod tick;

#[cfg(feature = "defmt-rtt")]
use defmt_rtt as _;
use panic_probe as _;

use core::fmt::Write;
use defmt::{unwrap, Format};
use fanctl_core::{
    cfg::Config,
    console::{Command, LineBuffer, HELP},
    event::{Event, EventFlags},
    fan::FanTach,
    heater::{HeaterAction, HeaterBank},
    i2c::{BusIrq, MAX_TRANSFER},
    i2c_engine::{I2cEngine, Sequenced},
    rtd::RtdBank,
    thermal::{ThermalCfg, ThermalController, Zone, ZONES},
    timer::{Recurrence, TimerError, TimerId, TimerRegistry},
    tmp1075::{self, Reading, Register, SensorBank},
    TICK_MS,
};
use heapless::Vec;
use rtic::Mutex;
use stm32f1xx_hal::{adc::Adc, pac::ADC1, prelude::*};

use crate::{
    adc::RtdInputs, board::Board, console::Console, i2c_master::I2c2Master, pwm::FanPwm, tick::SysTickGate,
};

/// Firmware version.
pub static VERSION: &[u8] = env!("CARGO_PKG_VERSION").as_bytes();

/// Copyright.
static COPYRIGHT: &[u8] = b"(c) 2022-2023 Sebastian Urban <surban@surban.net> license: GNU GPL version 3";

/// Number of fans.
pub const FANS: usize = 2;

/// Number of heaters.
pub const HEATERS: usize = 6;

/// Number of TMP1075 sensors.
pub const SENSORS: usize = 2;

/// Software timer slots.
const TIMERS: usize = 8;

/// Bus transactions: temperature and device id of every sensor.
const TRANSACTIONS: usize = 2 * SENSORS;

/// Console line length.
const LINE: usize = 64;

/// Board.
pub use boards::Chosen as ThisBoard;

/// Work carried out when a software timer expires.
#[derive(Clone, Copy, PartialEq, Eq, Format)]
pub enum Job {
    /// Toggle the status LED.
    Heartbeat,
    /// Print the console banner.
    Banner,
    /// Start the bus transaction sequence.
    BusKick,
    /// Check bus progress.
    BusWatchdog,
    /// Request an RTD conversion.
    AdcSample,
    /// Close a fan speed measurement window.
    FanRpm,
    /// Switch on the next heater.
    HeaterStagger,
    /// Request a diagnostics report.
    Diagnostics,
}

type Registry = TimerRegistry<SysTickGate, Job, TIMERS>;
type Engine = I2cEngine<Reading, TRANSACTIONS>;

/// Timers the foreground starts and stops.
pub struct Timers {
    bus_watchdog: TimerId,
    stagger: TimerId,
}

impl Timers {
    /// Defines all timers and starts those running from power up.
    fn define(reg: &mut Registry, cfg: &Config<FANS>) -> Result<Self, TimerError> {
        let running = [
            reg.define(100, Recurrence::OneShot, Job::Banner)?,
            reg.define(cfg.bus_start_delay_ticks, Recurrence::OneShot, Job::BusKick)?,
            reg.define(cfg.adc_period_ticks, Recurrence::Recurring, Job::AdcSample)?,
            reg.define(cfg.rpm_window_ticks, Recurrence::Recurring, Job::FanRpm)?,
            reg.define(cfg.diag_period_ticks, Recurrence::Recurring, Job::Diagnostics)?,
        ];
        for id in running {
            reg.register(id)?;
            reg.enable(id)?;
        }

        // Armed once the bus has been started.
        let bus_watchdog = reg.define(cfg.bus_watchdog_window_ticks, Recurrence::Recurring, Job::BusWatchdog)?;
        reg.register(bus_watchdog)?;

        // Registered while heaters are switched on.
        let stagger = reg.define(cfg.heater_stagger_ticks, Recurrence::Recurring, Job::HeaterStagger)?;

        Ok(Self { bus_watchdog, stagger })
    }
}

/// State owned by the foreground loop.
pub struct Foreground {
    timers: Timers,
    cfg: Config<FANS>,
    sensors: SensorBank<SENSORS>,
    rtds: RtdBank<FANS>,
    thermal: ThermalController<FANS>,
    heaters: HeaterBank<HEATERS>,
    line: LineBuffer<LINE>,
    diag: bool,
    adc_channel: usize,
    led: bool,
    adc: Adc<ADC1>,
    rtd_inputs: RtdInputs,
    pwm: FanPwm,
}

#[rtic::app(device = stm32f1::stm32f103, peripherals = true)]
mod app {
    use super::*;

    /// Shared resources.
    #[shared]
    struct Shared {
        /// Pending foreground work.
        events: EventFlags,
        /// Software timers.
        registry: Registry,
        /// Sensor bus transaction sequencer.
        engine: Engine,
        /// I2C 2 master.
        bus: I2c2Master,
        /// Fan tachometers.
        tach: FanTach<FANS>,
        /// Service console.
        console: Console,
        /// Board.
        board: ThisBoard,
    }

    /// Exclusive resources.
    #[local]
    struct Local {
        /// Foreground state.
        fg: Foreground,
    }

    /// Initialization (entry point).
    #[init]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        defmt::info!("fanctl version {:a}", VERSION);
        defmt::info!("{:a}", COPYRIGHT);

        let cfg = Config::<FANS>::default().validate();

        // Create HAL objects.
        let rcc = cx.device.RCC.constrain();
        let mut flash = cx.device.FLASH.constrain();
        let mut afio = cx.device.AFIO.constrain();
        let clocks = rcc.cfgr.freeze(&mut flash.acr);
        let adc = Adc::adc1(cx.device.ADC1, clocks);
        let mut gpioa = cx.device.GPIOA.split();
        let mut gpiob = cx.device.GPIOB.split();
        let _gpioc = cx.device.GPIOC.split();

        // Create board handler.
        let mut board = ThisBoard::new(&mut afio);
        defmt::info!("board model:    {:a}", ThisBoard::model());
        for heater in 0..HEATERS {
            board.set_heater(heater, false);
        }

        // Initialize I2C bus 2 master and its transaction table.
        let scl = gpiob.pb10.into_alternate_open_drain(&mut gpiob.crh);
        let sda = gpiob.pb11.into_alternate_open_drain(&mut gpiob.crh);
        let bus = I2c2Master::new(cx.device.I2C2, (scl, sda), ThisBoard::I2C2_MODE, clocks);

        let mut table = Vec::new();
        for (sensor, &addr) in ThisBoard::TMP1075_ADDRS.iter().enumerate() {
            let sensor = sensor as u8;
            for (reg, reading) in
                [(Register::Temperature, Reading::Temperature(sensor)), (Register::DeviceId, Reading::DeviceId(sensor))]
            {
                unwrap!(table.push(unwrap!(tmp1075::read_register(addr, reg, reading))).ok());
            }
        }
        let engine = Engine::new(table, cfg.bus_watchdog_min_completed);

        // Initialize fan outputs and console.
        let pwm_pins =
            (gpioa.pa6.into_alternate_push_pull(&mut gpioa.crl), gpioa.pa7.into_alternate_push_pull(&mut gpioa.crl));
        let pwm = FanPwm::new(cx.device.TIM3, pwm_pins, &clocks);
        let console_pins =
            (gpioa.pa9.into_alternate_push_pull(&mut gpioa.crh), gpioa.pa10.into_floating_input(&mut gpioa.crh));
        let console =
            Console::new(cx.device.USART1, console_pins, &mut afio.mapr, ThisBoard::CONSOLE_BAUD, &clocks);
        let rtd_inputs = RtdInputs::new();

        // Start ticking.
        let gate = SysTickGate::new(cx.core.SYST, &clocks);
        let mut registry = Registry::new(gate, cfg.heartbeat_ticks, Job::Heartbeat);
        let timers = unwrap!(Timers::define(&mut registry, &cfg));
        defmt::info!("{} software timers defined", registry.defined());

        let fg = Foreground {
            timers,
            cfg,
            sensors: SensorBank::new(),
            rtds: RtdBank::new(cfg.rtd_range),
            thermal: ThermalController::new(cfg.thermal),
            heaters: HeaterBank::new(cfg.heater),
            line: LineBuffer::new(),
            diag: false,
            adc_channel: 0,
            led: false,
            adc,
            rtd_inputs,
            pwm,
        };

        (
            Shared { events: EventFlags::new(), registry, engine, bus, tach: FanTach::new(), console, board },
            Local { fg },
            init::Monotonics(),
        )
    }

    /// Foreground loop.
    #[idle(shared = [&events, registry, engine, bus, tach, console, board], local = [fg])]
    fn idle(mut cx: idle::Context) -> ! {
        let events = cx.shared.events;
        let fg = cx.local.fg;

        loop {
            // An interrupt pending between the check and WFI still wakes the core.
            cortex_m::interrupt::free(|_| {
                if events.is_idle() {
                    rtic::export::wfi()
                }
            });

            events.dispatch(|event| handle_event(event, fg, &mut cx.shared));
        }
    }

    /// Runs the foreground handler of an event.
    fn handle_event(event: Event, fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        match event {
            Event::TICKER => service_timers(fg, shared),
            Event::BUS => {
                let events = shared.events;
                match (&mut shared.engine, &mut shared.bus).lock(|engine, bus| engine.service(bus, events)) {
                    Sequenced::Aborted(index) => defmt::warn!("bus transaction #{} skipped", index),
                    res => defmt::trace!("bus: {:?}", res),
                }
            }
            Event::SAMPLE_READY => sample_ready(fg, shared),
            Event::HEATER => {
                let stagger = fg.timers.stagger;
                if let Err(err) = shared.registry.lock(|reg| {
                    reg.disable(stagger)?;
                    reg.deregister(stagger)
                }) {
                    defmt::warn!("cannot stop heater stagger: {:?}", err);
                }
                fg.heaters.stagger_done();
                defmt::info!("heater stagger finished");
            }
            Event::ADC_SAMPLE => adc_sample(fg),
            Event::UART_RX => console_input(fg, shared),
            Event::UART_TX => defmt::trace!("console transmit queue drained"),
            Event::DIAGNOSTICS => {
                if fg.diag {
                    print_status(fg, shared);
                }
            }
            other => defmt::warn!("unhandled event {:?}", other),
        }
    }

    /// Runs the jobs of expired timers.
    ///
    /// Jobs run without holding the registry so that interrupts keep ticking.
    fn service_timers(fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        let expired = shared.registry.lock(|reg| reg.take_expired());
        for (id, job) in expired {
            run_job(job, fg, shared);
            shared.registry.lock(|reg| reg.finish(id));
        }
    }

    fn run_job(job: Job, fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        let events = shared.events;
        match job {
            Job::Heartbeat => {
                fg.led = !fg.led;
                let led = fg.led;
                shared.board.lock(|board| board.set_status_led(led));
            }
            Job::Banner => {
                defmt::info!("console ready");
                print_version(shared);
                shared.console.lock(|console| console.write_bytes(b"type help for commands\r\n> "));
            }
            Job::BusKick => {
                defmt::info!("starting sensor bus");
                (&mut shared.engine, &mut shared.bus).lock(|engine, bus| engine.begin(bus));
                let watchdog = fg.timers.bus_watchdog;
                if let Err(err) = shared.registry.lock(|reg| reg.enable(watchdog)) {
                    defmt::warn!("cannot arm bus watchdog: {:?}", err);
                }
            }
            Job::BusWatchdog => {
                if (&mut shared.engine, &mut shared.bus).lock(|engine, bus| engine.check_watchdog(bus)) {
                    defmt::warn!("sensor bus was reset by watchdog");
                }
            }
            Job::AdcSample => events.raise(Event::ADC_SAMPLE),
            Job::FanRpm => {
                let window_ms = fg.cfg.rpm_window_ticks as u32 * TICK_MS;
                shared.tach.lock(|tach| tach.compute(window_ms));
            }
            Job::HeaterStagger => {
                let step = fg.heaters.stagger_step(events);
                if let Some(heater) = step.heater {
                    defmt::info!("heater {} on", heater);
                    shared.board.lock(|board| board.set_heater(heater, true));
                }
            }
            Job::Diagnostics => events.raise(Event::DIAGNOSTICS),
        }
    }

    /// Transforms all completed bus transactions.
    fn sample_ready(fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        loop {
            let sample = shared.engine.lock(|engine| {
                let index = engine.take_ready()?;
                let xfer = engine.table().get(index)?;
                Some((xfer.kind(), Vec::<u8, MAX_TRANSFER>::from_slice(xfer.received()).ok()))
            });
            match sample {
                Some((reading, Some(data))) => ingest(reading, &data, fg, shared),
                Some((reading, None)) => defmt::warn!("oversized {:?} sample dropped", reading),
                None => break,
            }
        }
    }

    /// Feeds a TMP1075 reading to the heater control.
    fn ingest(reading: Reading, data: &[u8], fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        let Some(average) = fg.sensors.ingest(reading, data) else { return };
        defmt::debug!("TMP1075 average {} C", average);

        match fg.heaters.update(average) {
            HeaterAction::None => (),
            HeaterAction::StartStagger => {
                let stagger = fg.timers.stagger;
                if let Err(err) = shared.registry.lock(|reg| {
                    reg.register(stagger)?;
                    reg.enable(stagger)
                }) {
                    defmt::warn!("cannot start heater stagger: {:?}", err);
                }
            }
            HeaterAction::AllOff => shared.board.lock(|board| {
                for heater in 0..HEATERS {
                    board.set_heater(heater, false);
                }
            }),
        }
    }

    /// Converts one RTD channel and adjusts the fan it controls.
    fn adc_sample(fg: &mut Foreground) {
        let ch = fg.adc_channel;
        fg.adc_channel = (ch + 1) % FANS;

        let internal = fg.adc.read_temp() as f32;
        let Some(raw) = fg.rtd_inputs.read(&mut fg.adc, ch) else {
            defmt::warn!("RTD {} conversion failed", ch);
            return;
        };

        if let Some(duty) = fg.rtds.record(ch, raw, internal).and_then(|celsius| fg.thermal.update(ch, celsius)) {
            fg.pwm.set_duty_percent(ch, duty);
        }
    }

    /// Handles received console bytes.
    fn console_input(fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        while let Some(byte) = shared.console.lock(|console| console.read()) {
            let Some(line) = fg.line.push(byte) else { continue };
            match line.parse::<Command>() {
                Ok(cmd) => {
                    defmt::info!("console command {:?}", cmd);
                    execute(cmd, fg, shared);
                }
                Err(err) => shared.console.lock(|console| {
                    let _ = write!(console, "error: {}\r\n", err);
                }),
            }
            shared.console.lock(|console| console.write_bytes(b"> "));
        }
    }

    fn execute(cmd: Command, fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        match cmd {
            Command::Help => shared.console.lock(|console| console.write_bytes(HELP.as_bytes())),
            Command::Version => print_version(shared),
            Command::Status => print_status(fg, shared),
            Command::Diagnostics(on) => fg.diag = on,
            Command::BusReset => {
                (&mut shared.engine, &mut shared.bus).lock(|engine, bus| engine.reset_bus(bus));
            }
            Command::Duty { fan, zone, percent } => {
                let (fan, zone) = (fan as usize, zone as usize);
                if fan >= FANS || zone >= ZONES {
                    reply(shared, "no such fan or zone");
                    return;
                }
                let mut thermal = *fg.thermal.cfg();
                thermal.duty[fan][zone] = percent;
                apply_thermal(fg, thermal);
            }
            Command::Zone { zone, low, high } => {
                let zone = zone as usize;
                if zone >= ZONES {
                    reply(shared, "no such zone");
                    return;
                }
                let mut thermal = *fg.thermal.cfg();
                thermal.zones[zone] = Zone { low, high };
                apply_thermal(fg, thermal);
            }
            Command::DutyTable => print_duty_table(fg, shared),
            Command::ZoneTable => print_zone_table(fg, shared),
            Command::Hysteresis(Some(hysteresis)) => {
                let mut thermal = *fg.thermal.cfg();
                thermal.hysteresis = hysteresis;
                apply_thermal(fg, thermal);
            }
            Command::Hysteresis(None) => {
                let hysteresis = fg.thermal.cfg().hysteresis;
                shared.console.lock(|console| {
                    let _ = write!(console, "hysteresis {} C\r\n", hysteresis);
                });
            }
            Command::Range(Some((bound, celsius))) => match fg.cfg.rtd_range.with_bound(bound, celsius) {
                Some(range) => {
                    fg.cfg.rtd_range = range;
                    fg.rtds.set_range(range);
                }
                None => reply(shared, "min must not exceed max"),
            },
            Command::Range(None) => {
                let range = fg.rtds.range();
                shared.console.lock(|console| {
                    let _ = write!(console, "rtd range {:.1} C to {:.1} C\r\n", range.min, range.max);
                });
            }
            Command::Heater(on) => {
                fg.cfg.heater.enabled = on;
                fg.heaters.set_cfg(fg.cfg.heater);
            }
            Command::Defaults => {
                fg.cfg.restore_defaults();
                fg.heaters.set_cfg(fg.cfg.heater);
                fg.rtds.set_range(fg.cfg.rtd_range);
                let thermal = fg.cfg.thermal;
                apply_thermal(fg, thermal);
                reply(shared, "defaults restored");
            }
        }
    }

    fn apply_thermal(fg: &mut Foreground, thermal: ThermalCfg<FANS>) {
        fg.thermal.set_cfg(thermal);
        fg.cfg.thermal = *fg.thermal.cfg();
        for fan in 0..FANS {
            if let Some(duty) = fg.thermal.duty(fan) {
                fg.pwm.set_duty_percent(fan, duty);
            }
        }
    }

    fn reply(shared: &mut idle::SharedResources<'_>, msg: &str) {
        shared.console.lock(|console| {
            let _ = write!(console, "{}\r\n", msg);
        });
    }

    fn print_version(shared: &mut idle::SharedResources<'_>) {
        shared.console.lock(|console| {
            console.write_bytes(b"\r\nfanctl ");
            console.write_bytes(VERSION);
            console.write_bytes(b" on ");
            console.write_bytes(ThisBoard::model());
            console.write_bytes(b"\r\n");
        });
    }

    /// Prints the duty cycle of every fan in every zone.
    fn print_duty_table(fg: &Foreground, shared: &mut idle::SharedResources<'_>) {
        let thermal = fg.thermal.cfg();
        shared.console.lock(|console| {
            let _ = write!(console, "fan: duty in zones 0-{}\r\n", ZONES - 1);
            for (fan, duty) in thermal.duty.iter().enumerate() {
                let _ = write!(console, "{}:", fan);
                for percent in duty {
                    let _ = write!(console, " {:3}", percent);
                }
                console.write_bytes(b"\r\n");
            }
        });
    }

    /// Prints the zone bounds and the hysteresis.
    fn print_zone_table(fg: &Foreground, shared: &mut idle::SharedResources<'_>) {
        let thermal = fg.thermal.cfg();
        shared.console.lock(|console| {
            for (n, zone) in thermal.zones.iter().enumerate() {
                let _ = write!(console, "zone {}: {:.1} C to {:.1} C\r\n", n, zone.low, zone.high);
            }
            let _ = write!(console, "hysteresis {} C\r\n", thermal.hysteresis);
        });
    }

    /// Prints temperatures, fan speeds, heaters and bus statistics.
    fn print_status(fg: &mut Foreground, shared: &mut idle::SharedResources<'_>) {
        let stats = shared.engine.lock(|engine| engine.stats());
        let speeds: [_; FANS] =
            shared.tach.lock(|tach| core::array::from_fn(|fan| tach.speed(fan).unwrap_or_default()));

        shared.console.lock(|console| {
            for sensor in 0..SENSORS {
                let _ = write!(console, "tmp1075 {}: ", sensor);
                match fg.sensors.temperature(sensor) {
                    Some(celsius) => {
                        let _ = write!(console, "{:.1} C", celsius);
                    }
                    None => console.write_bytes(b"-"),
                }
                if fg.sensors.device_id_ok(sensor) == Some(false) {
                    console.write_bytes(b" (bad device id)");
                }
                console.write_bytes(b"\r\n");
            }

            for (fan, speed) in speeds.iter().enumerate() {
                let _ = write!(console, "fan {}: {} rpm", fan, speed.rpm);
                if let Some(celsius) = fg.rtds.celsius(fan) {
                    let source = if fg.rtds.is_measured(fan) { "rtd" } else { "internal" };
                    let _ = write!(console, ", {:.1} C ({})", celsius, source);
                }
                if let (Some(zone), Some(duty)) = (fg.thermal.zone(fan), fg.thermal.duty(fan)) {
                    let _ = write!(console, ", zone {} at {}%", zone, duty);
                }
                console.write_bytes(b"\r\n");
            }
            if let Some(average) = fg.rtds.average() {
                let _ = write!(console, "rtd average: {:.1} C\r\n", average);
            }

            console.write_bytes(b"heaters:");
            for heater in 0..HEATERS {
                console.write_bytes(if fg.heaters.is_on(heater) { b" on" } else { b" off" });
            }
            if !fg.heaters.cfg().enabled {
                console.write_bytes(b" (inhibited)");
            }
            console.write_bytes(b"\r\n");

            let _ = write!(
                console,
                "bus: {} completed, {} nak, {} resets\r\n",
                stats.completed, stats.naks, stats.resets
            );
            if console.dropped() > 0 {
                let _ = write!(console, "console: {} bytes dropped\r\n", console.dropped());
            }
        });
    }

    /// System tick.
    #[task(binds = SysTick, shared = [&events, registry], priority = 3)]
    fn systick(mut cx: systick::Context) {
        let events = cx.shared.events;
        cx.shared.registry.lock(|reg| reg.tick(events));
    }

    /// I2C 2 error interrupt handler.
    #[task(binds = I2C2_ER, priority = 2)]
    fn i2c2_er(_cx: i2c2_er::Context) {
        cortex_m::peripheral::NVIC::pend(stm32f1::stm32f103::Interrupt::I2C2_EV);
    }

    /// I2C 2 event interrupt handler.
    #[task(binds = I2C2_EV, shared = [&events, engine, bus], priority = 2)]
    fn i2c2_ev(cx: i2c2_ev::Context) {
        let events = cx.shared.events;
        (cx.shared.engine, cx.shared.bus).lock(|engine, bus| match bus.event() {
            Ok(irq) => {
                engine.on_irq(bus, irq, events);
            }
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(err)) => {
                defmt::warn!("I2C 2 error: {:?}", err);
                engine.on_irq(bus, BusIrq::Nak, events);
            }
        });
    }

    /// Fan 0 tachometer.
    #[task(binds = EXTI0, shared = [board, tach], priority = 2)]
    fn exti0(cx: exti0::Context) {
        (cx.shared.board, cx.shared.tach).lock(|board, tach| {
            if board.check_tach(0) {
                tach.pulse(0);
            }
        });
    }

    /// Fan 1 tachometer.
    #[task(binds = EXTI1, shared = [board, tach], priority = 2)]
    fn exti1(cx: exti1::Context) {
        (cx.shared.board, cx.shared.tach).lock(|board, tach| {
            if board.check_tach(1) {
                tach.pulse(1);
            }
        });
    }

    /// Console interrupt handler.
    #[task(binds = USART1, shared = [&events, console], priority = 2)]
    fn usart1(mut cx: usart1::Context) {
        let events = cx.shared.events;
        cx.shared.console.lock(|console| console.on_irq(events));
    }
}
