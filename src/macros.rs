use image::Rgba;

use crate::error::{IslError, IslResult};
use crate::props::PropertyTable;
use crate::view::ScriptEvaluator;

/// Everything a single substitution pass can draw values from, in
/// priority order: the ad-hoc `extra` table, the effective property
/// stack, the loop-index token family, date/time tokens, and finally
/// global application properties.
pub struct MacroContext<'a> {
    pub props: &'a PropertyTable,
    pub extra: Option<&'a PropertyTable>,
    pub app_props: &'a PropertyTable,
    pub loop_index: usize,
    /// Seconds since the Unix epoch, UTC. Tokens are formatted from this.
    pub now_epoch: i64,
    /// The active view's animation timestamp for `anim:`/`time:` tokens.
    pub anim_epoch: Option<i64>,
    pub evaluator: Option<&'a dyn ScriptEvaluator>,
}

/// Expand every `${name}` token in `s`.
///
/// Any token left unresolved is a hard error: silent partial
/// substitution would leak `${...}` into filenames and file contents.
/// A fully substituted result beginning with `jython:`, `interp.` or
/// `islInterpreter.` is handed to the injected expression evaluator and
/// replaced by its string result.
pub fn expand(s: &str, ctx: &MacroContext<'_>) -> IslResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    let mut unresolved = false;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated token; the leftover "${" fails below.
            out.push_str(&rest[start..]);
            rest = "";
            unresolved = true;
            break;
        };
        let name = &after[..end];
        match resolve(name, ctx) {
            Some(value) => out.push_str(&value),
            None => {
                unresolved = true;
                out.push_str(&rest[start..start + 2 + end + 1]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    if unresolved || out.contains("${") {
        return Err(IslError::unresolved_macro(out));
    }

    let out = apply_evaluator_prefix(out, ctx)?;
    Ok(out.replace("\\n", "\n"))
}

fn apply_evaluator_prefix(s: String, ctx: &MacroContext<'_>) -> IslResult<String> {
    let expr = if let Some(code) = s.strip_prefix("jython:") {
        Some(code.to_string())
    } else if s.starts_with("interp.") || s.starts_with("islInterpreter.") {
        Some(s.clone())
    } else {
        None
    };
    let Some(expr) = expr else {
        return Ok(s);
    };
    let evaluator = ctx
        .evaluator
        .ok_or_else(|| IslError::evaluation("no script evaluator configured"))?;
    evaluator.eval(&expr)
}

fn resolve(name: &str, ctx: &MacroContext<'_>) -> Option<String> {
    if let Some(extra) = ctx.extra
        && let Some(v) = extra.get(name)
    {
        return Some(v.clone());
    }
    if let Some(v) = ctx.props.get(name) {
        return Some(v.clone());
    }
    if let Some(v) = resolve_loop_index(name, ctx.loop_index) {
        return Some(v);
    }
    if let Some(v) = resolve_date(name, ctx) {
        return Some(v);
    }
    ctx.app_props.get(name).cloned()
}

fn resolve_loop_index(name: &str, index: usize) -> Option<String> {
    match name {
        "loopindex" => Some(index.to_string()),
        "loopindex_pad2" => Some(format!("{index:02}")),
        "loopindex_pad3" => Some(format!("{index:03}")),
        "loopindex_pad4" => Some(format!("{index:04}")),
        "loopindex_alpha" => Some(index_letter(index)),
        "loopindex_ALPHA" => Some(index_letter(index).to_uppercase()),
        "loopindex_roman" => Some(index_roman(index).to_lowercase()),
        "loopindex_ROMAN" => Some(index_roman(index)),
        _ => None,
    }
}

fn resolve_date(name: &str, ctx: &MacroContext<'_>) -> Option<String> {
    let (token, epoch) = if let Some(token) = name.strip_prefix("anim:") {
        (token, ctx.anim_epoch.unwrap_or(ctx.now_epoch))
    } else if let Some(token) = name.strip_prefix("time:") {
        (token, ctx.anim_epoch.unwrap_or(ctx.now_epoch))
    } else if let Some(token) = name.strip_prefix("now:") {
        (token, ctx.now_epoch)
    } else {
        (name, ctx.now_epoch)
    };
    format_date_token(token, epoch)
}

/// Publish the index-derived token family (`name`, `name_pad2/3/4`,
/// `name_alpha`, `name_ALPHA`, `name_roman`, `name_ROMAN`) into a
/// property table. Used for `viewindex` and the per-tile `split`
/// counters.
pub fn put_index(table: &mut PropertyTable, name: &str, index: usize) {
    table.insert(name.to_string(), index.to_string());
    table.insert(format!("{name}_pad2"), format!("{index:02}"));
    table.insert(format!("{name}_pad3"), format!("{index:03}"));
    table.insert(format!("{name}_pad4"), format!("{index:04}"));
    table.insert(format!("{name}_alpha"), index_letter(index));
    table.insert(format!("{name}_ALPHA"), index_letter(index).to_uppercase());
    table.insert(format!("{name}_roman"), index_roman(index).to_lowercase());
    table.insert(format!("{name}_ROMAN"), index_roman(index));
}

fn index_letter(index: usize) -> String {
    match u8::try_from(index) {
        Ok(i) if i < 26 => ((b'a' + i) as char).to_string(),
        _ => index.to_string(),
    }
}

fn index_roman(index: usize) -> String {
    // 1-based numeral for a 0-based index.
    let mut n = index + 1;
    let table: [(usize, &str); 13] = [
        (1000, "M"),
        (900, "CM"),
        (500, "D"),
        (400, "CD"),
        (100, "C"),
        (90, "XC"),
        (50, "L"),
        (40, "XL"),
        (10, "X"),
        (9, "IX"),
        (5, "V"),
        (4, "IV"),
        (1, "I"),
    ];
    let mut out = String::new();
    for (value, numeral) in table {
        while n >= value {
            out.push_str(numeral);
            n -= value;
        }
    }
    out
}

const MONTHS_SHORT: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const MONTHS_LONG: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];
const WEEKDAYS_SHORT: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Format one date-component token against a UTC epoch timestamp.
/// Returns `None` for names that are not date tokens.
pub fn format_date_token(token: &str, epoch: i64) -> Option<String> {
    let days = epoch.div_euclid(86_400);
    let secs = epoch.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let hour = (secs / 3600) as u32;
    let minute = ((secs % 3600) / 60) as u32;
    let second = (secs % 60) as u32;

    let value = match token {
        "G" => "AD".to_string(),
        "yyyy" => format!("{year:04}"),
        "yy" => format!("{:02}", year.rem_euclid(100)),
        "MMMMM" => MONTHS_LONG[(month - 1) as usize].to_string(),
        "MMM" => MONTHS_SHORT[(month - 1) as usize].to_string(),
        "MM" => format!("{month:02}"),
        "M" => month.to_string(),
        "dd" => format!("{day:02}"),
        "d" => day.to_string(),
        "D" => day_of_year(year, month, day).to_string(),
        "HH" => format!("{hour:02}"),
        "H" => hour.to_string(),
        "kk" => format!("{:02}", if hour == 0 { 24 } else { hour }),
        "k" => (if hour == 0 { 24 } else { hour }).to_string(),
        "KK" => format!("{:02}", hour % 12),
        "K" => (hour % 12).to_string(),
        "a" => (if hour < 12 { "AM" } else { "PM" }).to_string(),
        "mm" => format!("{minute:02}"),
        "ss" => format!("{second:02}"),
        "s" => second.to_string(),
        "S" => "0".to_string(),
        "EEE" => WEEKDAYS_SHORT[((days + 4).rem_euclid(7)) as usize].to_string(),
        "Z" => "+0000".to_string(),
        _ => return None,
    };
    Some(value)
}

/// Days-since-epoch to civil (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn day_of_year(year: i64, month: u32, day: u32) -> u32 {
    const CUM: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    let mut doy = CUM[(month - 1) as usize] + day;
    if leap && month > 2 {
        doy += 1;
    }
    doy
}

/// Parse a double that may be percent-relative: `"50%"` against base
/// 200 yields 100.0.
pub fn parse_relative_f64(s: &str, base: f64) -> Option<f64> {
    if let Some(pct) = s.strip_suffix('%') {
        let pct: f64 = pct.trim().parse().ok()?;
        Some(pct / 100.0 * base)
    } else {
        s.trim().parse().ok()
    }
}

/// Decode a color value: a well-known name, `#RRGGBB`, `#AARRGGBB`, or
/// bare hex digits. Returns `None` for anything unrecognized.
pub fn parse_color(s: &str) -> Option<Rgba<u8>> {
    let named: Option<[u8; 4]> = match s.to_ascii_lowercase().as_str() {
        "white" => Some([255, 255, 255, 255]),
        "black" => Some([0, 0, 0, 255]),
        "red" => Some([255, 0, 0, 255]),
        "green" => Some([0, 255, 0, 255]),
        "blue" => Some([0, 0, 255, 255]),
        "yellow" => Some([255, 255, 0, 255]),
        "orange" => Some([255, 200, 0, 255]),
        "cyan" => Some([0, 255, 255, 255]),
        "magenta" => Some([255, 0, 255, 255]),
        "pink" => Some([255, 175, 175, 255]),
        "gray" | "grey" => Some([128, 128, 128, 255]),
        "lightgray" | "lightgrey" => Some([192, 192, 192, 255]),
        "darkgray" | "darkgrey" => Some([64, 64, 64, 255]),
        _ => None,
    };
    if let Some(rgba) = named {
        return Some(Rgba(rgba));
    }

    let hex = s.strip_prefix('#').or_else(|| s.strip_prefix("0x")).unwrap_or(s);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    match hex.len() {
        6 => {
            let v = u32::from_str_radix(hex, 16).ok()?;
            Some(Rgba([(v >> 16) as u8, (v >> 8) as u8, v as u8, 255]))
        }
        8 => {
            let v = u32::from_str_radix(hex, 16).ok()?;
            Some(Rgba([
                (v >> 16) as u8,
                (v >> 8) as u8,
                v as u8,
                (v >> 24) as u8,
            ]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx<'a>(props: &'a PropertyTable, app: &'a PropertyTable) -> MacroContext<'a> {
        MacroContext {
            props,
            extra: None,
            app_props: app,
            loop_index: 0,
            // 2009-02-13 23:31:30 UTC
            now_epoch: 1_234_567_890,
            anim_epoch: None,
            evaluator: None,
        }
    }

    #[test]
    fn substitutes_properties() {
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), "world".to_string());
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        assert_eq!(expand("hello ${name}", &c).unwrap(), "hello world");
    }

    #[test]
    fn unresolved_token_is_an_error() {
        let props = BTreeMap::new();
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        assert!(matches!(
            expand("x ${missing} y", &c),
            Err(IslError::UnresolvedMacro(_))
        ));
        assert!(matches!(
            expand("dangling ${open", &c),
            Err(IslError::UnresolvedMacro(_))
        ));
    }

    #[test]
    fn fully_resolvable_strings_round_trip() {
        let mut props = BTreeMap::new();
        props.insert("a".to_string(), "1".to_string());
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        let out = expand("${a}/${loopindex}/${yyyy}", &c).unwrap();
        assert!(!out.contains("${"));
        assert_eq!(out, "1/0/2009");
    }

    #[test]
    fn loop_index_family() {
        let props = BTreeMap::new();
        let app = BTreeMap::new();
        let mut c = ctx(&props, &app);
        c.loop_index = 3;
        assert_eq!(expand("${loopindex}", &c).unwrap(), "3");
        assert_eq!(expand("${loopindex_pad3}", &c).unwrap(), "003");
        assert_eq!(expand("${loopindex_alpha}", &c).unwrap(), "d");
        assert_eq!(expand("${loopindex_ROMAN}", &c).unwrap(), "IV");
    }

    #[test]
    fn date_tokens_format_in_utc() {
        let props = BTreeMap::new();
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        assert_eq!(expand("${yyyy}-${MM}-${dd}", &c).unwrap(), "2009-02-13");
        assert_eq!(expand("${HH}:${mm}:${ss}", &c).unwrap(), "23:31:30");
        assert_eq!(expand("${EEE}", &c).unwrap(), "Fri");
        assert_eq!(expand("${MMM}", &c).unwrap(), "Feb");
    }

    #[test]
    fn anim_tokens_use_animation_time() {
        let props = BTreeMap::new();
        let app = BTreeMap::new();
        let mut c = ctx(&props, &app);
        c.anim_epoch = Some(0); // 1970-01-01
        assert_eq!(expand("${anim:yyyy}", &c).unwrap(), "1970");
        assert_eq!(expand("${time:dd}", &c).unwrap(), "01");
        // now: stays pinned to now.
        assert_eq!(expand("${now:yyyy}", &c).unwrap(), "2009");
    }

    #[test]
    fn properties_shadow_builtin_tokens() {
        let mut props = BTreeMap::new();
        props.insert("yyyy".to_string(), "custom".to_string());
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        assert_eq!(expand("${yyyy}", &c).unwrap(), "custom");
    }

    #[test]
    fn newline_escapes_unescape_last() {
        let props = BTreeMap::new();
        let app = BTreeMap::new();
        let c = ctx(&props, &app);
        assert_eq!(expand("a\\nb", &c).unwrap(), "a\nb");
    }

    #[test]
    fn percent_relative_doubles() {
        assert_eq!(parse_relative_f64("50%", 200.0), Some(100.0));
        assert_eq!(parse_relative_f64("120", 200.0), Some(120.0));
        assert_eq!(parse_relative_f64("oops", 200.0), None);
    }

    #[test]
    fn colors_decode() {
        assert_eq!(parse_color("red"), Some(Rgba([255, 0, 0, 255])));
        assert_eq!(parse_color("#00ff00"), Some(Rgba([0, 255, 0, 255])));
        assert_eq!(parse_color("80ff0000"), Some(Rgba([255, 0, 0, 128])));
        assert_eq!(parse_color("notacolor"), None);
    }

    #[test]
    fn roman_numerals() {
        assert_eq!(index_roman(0), "I");
        assert_eq!(index_roman(3), "IV");
        assert_eq!(index_roman(27), "XXVIII");
    }
}
