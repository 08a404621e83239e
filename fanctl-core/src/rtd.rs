//! PT1000 resistance temperature detectors.
//!
//! Each RTD forms the low side of a divider with a 1 kΩ reference resistor
//! across the 3.3 V bias; the ADC samples the divider tap.

/// Bias voltage of the divider.
pub const BIAS_VOLTS: f32 = 3.3;
/// Counts of the 12-bit ADC.
pub const ADC_COUNTS: f32 = 4096.0;
/// Reference resistor and RTD resistance at 0 °C.
pub const REF_OHMS: f32 = 1000.0;
/// Temperature coefficient of platinum.
pub const ALPHA: f32 = 0.00385;

/// Plausible temperature range in °C.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TempRange {
    /// Lowest plausible temperature.
    pub min: f32,
    /// Highest plausible temperature.
    pub max: f32,
}

impl Default for TempRange {
    fn default() -> Self {
        Self { min: -50.0, max: 105.0 }
    }
}

/// End of a [`TempRange`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bound {
    /// Lowest plausible temperature.
    Min,
    /// Highest plausible temperature.
    Max,
}

impl TempRange {
    /// Whether `celsius` lies within the range.
    pub fn contains(&self, celsius: f32) -> bool {
        celsius >= self.min && celsius <= self.max
    }

    /// Range with one end moved to `celsius`.
    ///
    /// Returns `None` if the range would be inverted.
    pub fn with_bound(self, bound: Bound, celsius: f32) -> Option<Self> {
        let range = match bound {
            Bound::Min => Self { min: celsius, ..self },
            Bound::Max => Self { max: celsius, ..self },
        };
        (range.min <= range.max).then_some(range)
    }
}

/// Converts a raw ADC sample to °C.
///
/// Returns `None` at full scale, where no current flows through the divider.
pub fn adc_to_celsius(raw: u16) -> Option<f32> {
    let volts = BIAS_VOLTS / ADC_COUNTS * raw as f32;
    let amps = (BIAS_VOLTS - volts) / REF_OHMS;
    if amps <= 0.0 {
        return None;
    }

    let ohms = volts / amps;
    Some((ohms / REF_OHMS - 1.0) / ALPHA)
}

/// Latest temperatures of a set of RTD channels.
///
/// Implausible readings are replaced by the internal temperature sensor.
pub struct RtdBank<const N: usize> {
    range: TempRange,
    celsius: [Option<f32>; N],
    measured: [bool; N],
    reported: u32,
    average: Option<f32>,
}

impl<const N: usize> RtdBank<N> {
    const CAPACITY_OK: () = assert!(N >= 1 && N <= 32, "RTD bank holds 1..=32 channels");
    const ALL: u32 = if N == 32 { u32::MAX } else { (1 << N) - 1 };

    /// Creates a bank accepting readings within `range`.
    pub const fn new(range: TempRange) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Self { range, celsius: [None; N], measured: [false; N], reported: 0, average: None }
    }

    /// Plausible range.
    pub fn range(&self) -> TempRange {
        self.range
    }

    /// Changes the plausible range.
    ///
    /// Channels are judged against it from their next sample on.
    pub fn set_range(&mut self, range: TempRange) {
        self.range = range;
    }

    /// Records a sample of `channel` and returns the temperature used.
    ///
    /// `internal` is the on-chip temperature substituted for implausible
    /// readings. The average is updated once every channel has reported.
    pub fn record(&mut self, channel: usize, raw: u16, internal: f32) -> Option<f32> {
        if channel >= N {
            return None;
        }

        let celsius = match adc_to_celsius(raw) {
            Some(celsius) if self.range.contains(celsius) => {
                self.measured[channel] = true;
                celsius
            }
            other => {
                if self.measured[channel] {
                    warn!("RTD {} implausible ({:?}), using internal sensor", channel, other);
                }
                self.measured[channel] = false;
                internal
            }
        };
        self.celsius[channel] = Some(celsius);

        self.reported |= 1 << channel;
        if self.reported == Self::ALL {
            self.reported = 0;
            let sum: f32 = self.celsius.iter().flatten().sum();
            self.average = Some(sum / N as f32);
        }

        Some(celsius)
    }

    /// Latest temperature of a channel in °C.
    pub fn celsius(&self, channel: usize) -> Option<f32> {
        self.celsius.get(channel).copied().flatten()
    }

    /// Whether the latest temperature of a channel was measured by its RTD.
    pub fn is_measured(&self, channel: usize) -> bool {
        self.measured.get(channel).copied().unwrap_or_default()
    }

    /// Average of all channels in °C.
    pub fn average(&self) -> Option<f32> {
        self.average
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_for(celsius: f32) -> u16 {
        let ohms = REF_OHMS * (1.0 + ALPHA * celsius);
        let volts = BIAS_VOLTS * ohms / (ohms + REF_OHMS);
        (volts / BIAS_VOLTS * ADC_COUNTS).round() as u16
    }

    #[test]
    fn converts_divider_tap_to_celsius() {
        // Equal resistances put the tap at half scale.
        let zero = adc_to_celsius(2048).unwrap();
        assert!(zero.abs() < 0.01, "{zero}");

        let warm = adc_to_celsius(raw_for(40.0)).unwrap();
        assert!((warm - 40.0).abs() < 0.5, "{warm}");

        assert_eq!(adc_to_celsius(4096), None);
    }

    #[test]
    fn implausible_readings_fall_back_to_internal_sensor() {
        let mut bank = RtdBank::<2>::new(TempRange::default());

        assert_eq!(bank.record(0, 4095, 31.0), Some(31.0));
        assert!(!bank.is_measured(0));

        let t = bank.record(1, raw_for(20.0), 31.0).unwrap();
        assert!((t - 20.0).abs() < 0.5);
        assert!(bank.is_measured(1));

        let avg = bank.average().unwrap();
        assert!((avg - (31.0 + t) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn narrowed_range_rejects_readings() {
        let mut bank = RtdBank::<1>::new(TempRange::default());
        let raw = raw_for(60.0);
        assert!(bank.record(0, raw, 25.0).is_some_and(|t| (t - 60.0).abs() < 0.5));

        let range = bank.range().with_bound(Bound::Max, 50.0).unwrap();
        bank.set_range(range);

        assert_eq!(bank.record(0, raw, 25.0), Some(25.0));
        assert!(!bank.is_measured(0));
    }

    #[test]
    fn inverted_bounds_are_refused() {
        let range = TempRange { min: 0.0, max: 40.0 };

        assert_eq!(range.with_bound(Bound::Min, -10.0), Some(TempRange { min: -10.0, max: 40.0 }));
        assert_eq!(range.with_bound(Bound::Min, 41.0), None);
        assert_eq!(range.with_bound(Bound::Max, -1.0), None);
        assert_eq!(range.with_bound(Bound::Max, 0.0), Some(TempRange { min: 0.0, max: 0.0 }));
    }

    #[test]
    fn unknown_channel_is_ignored() {
        let mut bank = RtdBank::<1>::new(TempRange::default());

        assert_eq!(bank.record(3, 2048, 25.0), None);
        assert_eq!(bank.average(), None);
    }
}
