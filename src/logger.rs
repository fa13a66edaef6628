use crate::config::Cfg;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::threshold::ThresholdFilter;
use std::cmp::max;
use std::str::FromStr;

pub fn init_logger(cfg: &Cfg) {
    let console_level =
        LevelFilter::from_str(&cfg.console_log_level).unwrap_or(LevelFilter::Info);
    let logfile_level =
        LevelFilter::from_str(&cfg.logfile_log_level).unwrap_or(LevelFilter::Warn);

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&cfg.console_log_pattern)))
        .build();

    let mut config = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(console_level)))
            .build("stdout", Box::new(stdout)),
    );
    let mut root = Root::builder().appender("stdout");
    let mut level = console_level;

    if cfg.file_logging {
        let roller = FixedWindowRoller::builder()
            .build("aggregator.{}.log", cfg.logfile_max_count)
            .unwrap();
        let trigger = SizeTrigger::new(cfg.logfile_max_size * 1024 * 1024);
        let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));
        let logfile = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&cfg.logfile_log_pattern)))
            .build("aggregator.log", Box::new(policy))
            .unwrap();
        config = config.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(logfile_level)))
                .build("logfile", Box::new(logfile)),
        );
        root = root.appender("logfile");
        level = max(level, logfile_level);
    }

    let config = config.build(root.build(level)).unwrap();
    log4rs::init_config(config).unwrap();
}
