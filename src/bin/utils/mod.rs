use std::io;

use log::SetLoggerError;

pub fn setup_logging(verbosity_level: u32) -> Result<(), SetLoggerError> {
    use fern::colors::{Color, ColoredLevelConfig};

    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::White)
        .debug(Color::BrightWhite)
        .trace(Color::Cyan);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            let color = colors.get_color(&record.level());
            let foreground = color.to_fg_str();
            let target = record.target();
            let level = record.level();

            let prefix = format!("[{}][{}]\x1b[{}m ", target, level, foreground);
            const SUFFIX: &str = "\x1b[0m";

            let s = format!("{}", message);
            let num_lines = s.split('\n').count().max(1);
            let c = s.len() + num_lines * (prefix.len() + SUFFIX.len()) + num_lines;
            let mut buf = String::with_capacity(c);
            for (i, line) in s.split('\n').enumerate() {
                buf += &prefix;
                buf += line;
                buf += SUFFIX;
                if i != num_lines - 1 {
                    buf.push('\n');
                }
            }

            debug_assert!(c >= buf.len());

            out.finish(format_args!("{}", buf))
        })
        .level(match verbosity_level {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        // stdout carries file contents for `cat`.
        .chain(io::stderr())
        .apply()
}

#[allow(non_upper_case_globals)]
pub fn size_to_string(s: u64) -> String {
    const KiB: u64 = 1024;
    const MiB: u64 = KiB * 1024;
    const GiB: u64 = MiB * 1024;
    const TiB: u64 = GiB * 1024;

    match s {
        0..=1023 => format!("{} B", s),
        1024..=1048575 => format!("{} KiB", s / KiB),
        1048576..=1073741823 => format!("{} MiB", s / MiB),
        1073741824..=1099511627775 => format!("{} GiB", s / GiB),
        _ => format!("{} TiB", s / TiB),
    }
}
