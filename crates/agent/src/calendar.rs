//! Wall-clock context for `result_for_context` answers

use chinese_lunisolar_calendar::{LunisolarDate, SolarDate};
use chrono::{Datelike, Local, Timelike};

pub struct TimeInfo {
    pub time: String,
    pub date: String,
    pub weekday: String,
    pub lunar: Option<String>,
}

const WEEKDAYS: [&str; 7] = [
    "星期一", "星期二", "星期三", "星期四", "星期五", "星期六", "星期日",
];

pub fn current_time_info() -> TimeInfo {
    let now = Local::now();
    let weekday = WEEKDAYS[now.weekday().num_days_from_monday() as usize];
    let lunar = SolarDate::from_ymd(now.year() as u16, now.month() as u8, now.day() as u8)
        .ok()
        .and_then(|solar| LunisolarDate::from_solar_date(solar).ok())
        .map(|lunar| lunar.to_string());

    TimeInfo {
        time: format!("{:02}:{:02}", now.hour(), now.minute()),
        date: format!("{}年{}月{}日", now.year(), now.month(), now.day()),
        weekday: weekday.to_string(),
        lunar,
    }
}

/// Prompt prefix asking the model to answer with today's context in hand.
pub fn context_prompt(question: &str) -> String {
    let info = current_time_info();
    let lunar = info.lunar.unwrap_or_else(|| "未知".to_string());
    format!(
        "当前时间：{}\n今天日期：{} ({})\n今天农历：{}\n\n请根据以上信息回答用户的问题：{}",
        info.time, info.date, info.weekday, lunar, question
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_question_and_date() {
        let prompt = context_prompt("明天星期几？");
        assert!(prompt.contains("明天星期几？"));
        assert!(prompt.contains("今天日期"));
        assert!(prompt.contains("今天农历"));
    }

    #[test]
    fn time_info_is_well_formed() {
        let info = current_time_info();
        assert_eq!(info.time.len(), 5);
        assert!(info.date.contains('年'));
        assert!(info.weekday.starts_with("星期"));
    }
}
