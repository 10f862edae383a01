//! Per-calendar-day grouping.

use crate::records::TimelineItem;
use crate::timestamp;
use std::collections::HashMap;

/// Items of one calendar day, in sequencer order
#[derive(Debug, Clone, PartialEq)]
pub struct DayItems {
    pub date: String,
    pub items: Vec<TimelineItem>,
}

/// Partition sequenced items by `date_divider`.
///
/// Days are ordered by the parsed date, not by the divider text: `DD.MM.YYYY`
/// does not sort correctly as a string.
pub fn group_by_day(items: Vec<TimelineItem>) -> Vec<DayItems> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut days: Vec<DayItems> = Vec::new();

    for item in items {
        match slots.get(&item.date_divider) {
            Some(&slot) => days[slot].items.push(item),
            None => {
                slots.insert(item.date_divider.clone(), days.len());
                days.push(DayItems {
                    date: item.date_divider.clone(),
                    items: vec![item],
                });
            }
        }
    }

    days.sort_by_key(|day| timestamp::parse_day(&day.date));
    days
}
