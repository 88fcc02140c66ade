//! Ephemeris collaborator
//!
//! The engine treats astrometric math as an external collaborator: given a
//! reference time and observer location it answers "how long until this target
//! crosses the meridian" and "when does astronomical darkness start and end".
//! A cache keyed by (date, rounded location) avoids recomputing the twilight
//! windows every poll.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Ratio of a solar day to a sidereal day.
const SIDEREAL_RATE: f64 = 1.002_737_909;

/// Sun altitude below which astronomical darkness holds, in degrees.
const ASTRONOMICAL_TWILIGHT_DEG: f64 = -18.0;

/// Astronomical darkness window for one night.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwilightWindows {
    /// When the sun drops below -18 degrees, if it does at all that day.
    pub dusk: Option<DateTime<Utc>>,
    /// When the sun climbs back above -18 degrees after dusk.
    pub dawn: Option<DateTime<Utc>>,
}

pub trait Ephemeris: Send + Sync {
    /// Signed time until the target's upper meridian crossing. Negative once
    /// the target is past the meridian. Monotonically shrinking between
    /// successive calls for a fixed target.
    fn time_to_meridian(&self, ra_hours: f64, longitude: f64, at: DateTime<Utc>) -> Duration;

    /// Sun altitude in degrees at the given instant and observer location.
    fn sun_altitude(&self, latitude: f64, longitude: f64, at: DateTime<Utc>) -> f64;

    /// Astronomical darkness window for the 24 hours starting at `from`.
    fn twilight(&self, latitude: f64, longitude: f64, from: DateTime<Utc>) -> TwilightWindows;

    fn is_dark(&self, latitude: f64, longitude: f64, at: DateTime<Utc>) -> bool {
        self.sun_altitude(latitude, longitude, at) < ASTRONOMICAL_TWILIGHT_DEG
    }
}

pub type SharedEphemeris = Arc<dyn Ephemeris>;

/// Julian Day for a UTC timestamp.
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let time_fraction =
        (dt.hour() as f64 + dt.minute() as f64 / 60.0 + dt.second() as f64 / 3600.0) / 24.0;

    jd + time_fraction
}

/// Local Sidereal Time in hours for a Julian Day and east longitude.
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837
        + 360.98564736629 * (jd - 2451545.0)
        + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    let lst = (gmst + longitude) % 360.0;
    if lst < 0.0 {
        (lst + 360.0) / 15.0
    } else {
        lst / 15.0
    }
}

/// Hour angle in hours, normalized to [-12, 12).
pub fn hour_angle(ra_hours: f64, lst_hours: f64) -> f64 {
    let mut ha = (lst_hours - ra_hours) % 24.0;
    if ha < -12.0 {
        ha += 24.0;
    } else if ha >= 12.0 {
        ha -= 24.0;
    }
    ha
}

/// Closed-form ephemeris using low-precision solar and sidereal formulas.
///
/// Accuracy is on the order of a minute, which is ample for scheduling flips
/// and darkness checks; swap in a high-precision implementation behind the
/// same trait if that ever stops being true.
#[derive(Debug, Default)]
pub struct SiderealEphemeris;

impl Ephemeris for SiderealEphemeris {
    fn time_to_meridian(&self, ra_hours: f64, longitude: f64, at: DateTime<Utc>) -> Duration {
        let lst = local_sidereal_time(julian_day(&at), longitude);
        let ha = hour_angle(ra_hours, lst);
        // Negative hour angle means the target is east of the meridian,
        // i.e. the crossing is still ahead. Convert sidereal hours to solar.
        let solar_secs = -ha * 3600.0 / SIDEREAL_RATE;
        Duration::milliseconds((solar_secs * 1000.0) as i64)
    }

    fn sun_altitude(&self, latitude: f64, longitude: f64, at: DateTime<Utc>) -> f64 {
        let jd = julian_day(&at);
        let days_since_j2000 = jd - 2451545.0;

        let mean_longitude = (280.46 + 0.9856474 * days_since_j2000).rem_euclid(360.0);
        let mean_anomaly = (357.528 + 0.9856003 * days_since_j2000).rem_euclid(360.0);

        let ecliptic_longitude = mean_longitude
            + 1.915 * mean_anomaly.to_radians().sin()
            + 0.020 * (2.0 * mean_anomaly.to_radians()).sin();

        let obliquity = 23.439 - 0.0000004 * days_since_j2000;
        let sun_dec = (obliquity.to_radians().sin() * ecliptic_longitude.to_radians().sin())
            .asin()
            .to_degrees();
        let sun_ra = (ecliptic_longitude.to_radians().sin() * obliquity.to_radians().cos())
            .atan2(ecliptic_longitude.to_radians().cos())
            .to_degrees()
            .rem_euclid(360.0)
            / 15.0;

        let lst = local_sidereal_time(jd, longitude);
        let ha_rad = (hour_angle(sun_ra, lst) * 15.0).to_radians();
        let dec_rad = sun_dec.to_radians();
        let lat_rad = latitude.to_radians();

        (lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos())
            .asin()
            .to_degrees()
    }

    fn twilight(&self, latitude: f64, longitude: f64, from: DateTime<Utc>) -> TwilightWindows {
        // Minute-resolution scan over the next 24 hours. 1440 closed-form
        // evaluations, so not worth anything cleverer.
        let mut dusk = None;
        let mut dawn = None;
        let mut previously_dark = self.is_dark(latitude, longitude, from);

        for minute in 1..=(24 * 60) {
            let t = from + Duration::minutes(minute);
            let dark = self.is_dark(latitude, longitude, t);
            if dark && !previously_dark && dusk.is_none() {
                dusk = Some(t);
            }
            if !dark && previously_dark && dusk.is_some() && dawn.is_none() {
                dawn = Some(t);
                break;
            }
            previously_dark = dark;
        }

        TwilightWindows { dusk, dawn }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TwilightKey {
    date: NaiveDate,
    // Latitude/longitude rounded to 0.01 degree, about a kilometre.
    lat_centi: i32,
    lon_centi: i32,
}

/// Caching wrapper over any [`Ephemeris`].
///
/// Twilight windows are memoized by (date, rounded location). Meridian
/// countdowns are passed through untouched; they must keep shrinking.
pub struct EphemerisCache {
    inner: SharedEphemeris,
    twilight_cache: Mutex<HashMap<TwilightKey, TwilightWindows>>,
}

impl EphemerisCache {
    pub fn new(inner: SharedEphemeris) -> Self {
        Self {
            inner,
            twilight_cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Ephemeris for EphemerisCache {
    fn time_to_meridian(&self, ra_hours: f64, longitude: f64, at: DateTime<Utc>) -> Duration {
        self.inner.time_to_meridian(ra_hours, longitude, at)
    }

    fn sun_altitude(&self, latitude: f64, longitude: f64, at: DateTime<Utc>) -> f64 {
        self.inner.sun_altitude(latitude, longitude, at)
    }

    fn twilight(&self, latitude: f64, longitude: f64, from: DateTime<Utc>) -> TwilightWindows {
        let key = TwilightKey {
            date: from.date_naive(),
            lat_centi: (latitude * 100.0).round() as i32,
            lon_centi: (longitude * 100.0).round() as i32,
        };

        if let Ok(cache) = self.twilight_cache.lock() {
            if let Some(windows) = cache.get(&key) {
                return *windows;
            }
        }

        let windows = self.inner.twilight(latitude, longitude, from);
        if let Ok(mut cache) = self.twilight_cache.lock() {
            cache.insert(key, windows);
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn julian_day_at_j2000_epoch() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let jd = julian_day(&dt);
        assert!((jd - 2451545.0).abs() < 0.001);
    }

    #[test]
    fn sidereal_time_increases_eastward() {
        let jd = 2451545.0;
        let lst_greenwich = local_sidereal_time(jd, 0.0);
        let lst_east = local_sidereal_time(jd, 15.0);

        let diff = lst_east - lst_greenwich;
        assert!((diff - 1.0).abs() < 0.1 || (diff + 23.0).abs() < 0.1);
    }

    #[test]
    fn hour_angle_is_normalized() {
        assert!((hour_angle(0.0, 23.0) - (-1.0)).abs() < 1e-9);
        assert!((hour_angle(23.0, 0.0) - 1.0).abs() < 1e-9);
        assert!((hour_angle(6.0, 18.0) - (-12.0)).abs() < 1e-9);
    }

    #[test]
    fn meridian_countdown_shrinks() {
        let eph = SiderealEphemeris;
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        let t1 = t0 + Duration::minutes(30);

        // Pick an RA two sidereal hours ahead of the LST at t0.
        let lst = local_sidereal_time(julian_day(&t0), -120.0);
        let ra = (lst + 2.0) % 24.0;

        let r0 = eph.time_to_meridian(ra, -120.0, t0);
        let r1 = eph.time_to_meridian(ra, -120.0, t1);
        assert!(r0 > r1);
        assert!((r0.num_minutes() - 120).abs() <= 2);
    }

    #[test]
    fn sun_is_below_horizon_at_local_midnight() {
        let eph = SiderealEphemeris;
        // Midnight UTC at Greenwich, mid-northern latitude, in March.
        let at = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert!(eph.sun_altitude(51.5, 0.0, at) < 0.0);
    }

    #[test]
    fn twilight_cache_computes_once_per_key() {
        struct Counting(AtomicUsize);
        impl Ephemeris for Counting {
            fn time_to_meridian(&self, _: f64, _: f64, _: DateTime<Utc>) -> Duration {
                Duration::zero()
            }
            fn sun_altitude(&self, _: f64, _: f64, _: DateTime<Utc>) -> f64 {
                0.0
            }
            fn twilight(&self, _: f64, _: f64, _: DateTime<Utc>) -> TwilightWindows {
                self.0.fetch_add(1, Ordering::SeqCst);
                TwilightWindows {
                    dusk: None,
                    dawn: None,
                }
            }
        }

        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let cache = EphemerisCache::new(counter.clone());
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        cache.twilight(45.0, -122.0, at);
        cache.twilight(45.0011, -122.0011, at); // rounds to the same key
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        cache.twilight(46.0, -122.0, at);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
