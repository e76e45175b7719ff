use std::time::{SystemTime, UNIX_EPOCH};

//    Thanks to Howard Hinnant
// Original author of the legendary date algorithms:
//     https://github.com/HowardHinnant/date
//
// The days-from-civil inverse below is all we need for the `Date` header.

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Broken-down UTC time: (year, month 1-12, day 1-31, hour, minute, second, weekday 0=Sun).
pub type Civil = (i64, u8, u8, u8, u8, u8, u8);

#[inline(always)]
pub fn howard_hinnant(secs: i64) -> Civil {
    const SECS_PER_DAY: i64 = 86_400;
    let secs_of_day: i64 = secs.rem_euclid(SECS_PER_DAY);
    let mut z: i64 = secs.div_euclid(SECS_PER_DAY);
    // 1970-01-01 was a Thursday
    let wday: u8 = (z + 4).rem_euclid(7) as u8;
    // Shift base to 0000-03-01 so leap days land at the end of the year
    z += 719_468;
    let era: i64 = z.div_euclid(146_097);
    let doe: i64 = z - era * 146_097;
    let yoe: i64 = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy: i64 = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp: i64 = (5 * doy + 2) / 153;
    let d: u8 = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m: u8 = ((mp + 2) % 12 + 1) as u8;
    let y: i64 = yoe + era * 400 + mp / 10;
    (
        y,
        m,
        d,
        (secs_of_day / 3600) as u8,
        ((secs_of_day / 60) % 60) as u8,
        (secs_of_day % 60) as u8,
        wday,
    )
}

/// IMF-fixdate for a unix timestamp, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(secs: i64) -> String {
    let (y, m, d, h, mnt, s, wday) = howard_hinnant(secs);
    format!(
        "{}, {:02} {} {:04} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[wday as usize],
        d,
        MONTHS[(m - 1) as usize],
        y,
        h,
        mnt,
        s
    )
}

/// `Date` header value for right now.
pub fn http_date_now() -> String {
    let secs: i64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    format_http_date(secs)
}
