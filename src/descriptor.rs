//! HID report-descriptor decoding.
//!
//! Walks the short-item grammar just far enough to answer the questions the
//! rest of the crate asks: which usages each top-level collection declares,
//! which report IDs are in play, and how long the biggest input/output/
//! feature reports are (including the report-ID byte). Field-level layout
//! (logical ranges, bit offsets) is deliberately not modeled here.

use crate::error::{DeviceError, Result};
use crate::indexes::Indexes;

const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;
const TYPE_LOCAL: u8 = 2;

// Main item tags.
const TAG_INPUT: u8 = 0b1000;
const TAG_OUTPUT: u8 = 0b1001;
const TAG_FEATURE: u8 = 0b1011;
const TAG_COLLECTION: u8 = 0b1010;
const TAG_END_COLLECTION: u8 = 0b1100;

// Global item tags.
const TAG_USAGE_PAGE: u8 = 0;
const TAG_REPORT_SIZE: u8 = 7;
const TAG_REPORT_ID: u8 = 8;
const TAG_REPORT_COUNT: u8 = 9;
const TAG_PUSH: u8 = 10;
const TAG_POP: u8 = 11;

// Local item tags.
const TAG_USAGE: u8 = 0;
const TAG_USAGE_MIN: u8 = 1;
const TAG_USAGE_MAX: u8 = 2;

/// One top-level collection of the descriptor.
#[derive(Clone, Debug)]
pub struct DeviceItem {
    usages: Indexes,
    report_ids: Indexes,
}

impl DeviceItem {
    /// Usages declared for this collection, in declaration order.
    pub fn usages(&self) -> &Indexes {
        &self.usages
    }

    /// Report IDs seen inside this collection; [`Indexes::Unset`] when the
    /// device does not use report IDs.
    pub fn report_ids(&self) -> &Indexes {
        &self.report_ids
    }
}

/// Decoded summary of a raw report descriptor.
#[derive(Clone, Debug)]
pub struct ReportDescriptor {
    device_items: Vec<DeviceItem>,
    max_input: usize,
    max_output: usize,
    max_feature: usize,
    reports_use_id: bool,
}

#[derive(Clone, Default)]
struct Globals {
    usage_page: u32,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

#[derive(Default)]
struct Locals {
    // Each entry is an inclusive extended-usage range; single usages are
    // stored as (v, v) so declaration order survives.
    usages: Vec<(u32, u32)>,
    usage_min: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ReportKind {
    Input,
    Output,
    Feature,
}

impl ReportDescriptor {
    /// Decodes `bytes`. Unbalanced collections fail with
    /// [`DeviceError::Io`]; a truncated trailing item is ignored, matching
    /// kernel behavior.
    pub fn parse(bytes: &[u8]) -> Result<ReportDescriptor> {
        let mut globals = Globals::default();
        let mut global_stack: Vec<Globals> = Vec::new();
        let mut locals = Locals::default();

        let mut device_items: Vec<DeviceItem> = Vec::new();
        let mut item_report_ids: Vec<Vec<u32>> = Vec::new();
        let mut current_item: Option<usize> = None;
        let mut depth = 0usize;
        let mut reports_use_id = false;

        // (kind, report id) -> accumulated payload bits
        let mut bits: std::collections::HashMap<(ReportKind, u8), u32> =
            std::collections::HashMap::new();

        let mut i = 0usize;
        while i < bytes.len() {
            let prefix = bytes[i];
            if prefix == 0b1111_1110 {
                // Long item: skip over size + tag + data.
                if i + 2 > bytes.len() {
                    break;
                }
                let size = bytes[i + 1] as usize;
                i = i.saturating_add(2 + size + 1);
                continue;
            }

            let size = match prefix & 0b11 {
                0 => 0,
                1 => 1,
                2 => 2,
                _ => 4,
            };
            if i + 1 + size > bytes.len() {
                break;
            }
            let data = &bytes[i + 1..i + 1 + size];
            let value = data
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
            let item_type = (prefix >> 2) & 0b11;
            let tag = prefix >> 4;
            i += 1 + size;

            match item_type {
                TYPE_GLOBAL => match tag {
                    TAG_USAGE_PAGE => globals.usage_page = value,
                    TAG_REPORT_SIZE => globals.report_size = value,
                    TAG_REPORT_COUNT => globals.report_count = value,
                    TAG_REPORT_ID => {
                        reports_use_id = true;
                        globals.report_id = value as u8;
                        if let Some(item) = current_item {
                            if !item_report_ids[item].contains(&value) {
                                item_report_ids[item].push(value);
                            }
                        }
                    }
                    TAG_PUSH => global_stack.push(globals.clone()),
                    TAG_POP => {
                        if let Some(saved) = global_stack.pop() {
                            globals = saved;
                        }
                    }
                    _ => {}
                },
                TYPE_LOCAL => match tag {
                    TAG_USAGE => {
                        let usage = extend_usage(globals.usage_page, value, size);
                        locals.usages.push((usage, usage));
                    }
                    TAG_USAGE_MIN => {
                        locals.usage_min = Some(extend_usage(globals.usage_page, value, size));
                    }
                    TAG_USAGE_MAX => {
                        let hi = extend_usage(globals.usage_page, value, size);
                        let lo = locals.usage_min.take().unwrap_or(hi);
                        locals.usages.push((lo.min(hi), lo.max(hi)));
                    }
                    _ => {}
                },
                TYPE_MAIN => {
                    match tag {
                        TAG_COLLECTION => {
                            if depth == 0 {
                                device_items.push(DeviceItem {
                                    usages: if locals.usages.is_empty() {
                                        Indexes::Unset
                                    } else {
                                        Indexes::from_ranges(locals.usages.clone())
                                    },
                                    report_ids: Indexes::Unset,
                                });
                                item_report_ids.push(Vec::new());
                                current_item = Some(device_items.len() - 1);
                            }
                            depth += 1;
                        }
                        TAG_END_COLLECTION => {
                            if depth == 0 {
                                return Err(DeviceError::Io(
                                    "malformed report descriptor: unbalanced End Collection".into(),
                                ));
                            }
                            depth -= 1;
                            if depth == 0 {
                                current_item = None;
                            }
                        }
                        TAG_INPUT | TAG_OUTPUT | TAG_FEATURE => {
                            let kind = match tag {
                                TAG_INPUT => ReportKind::Input,
                                TAG_OUTPUT => ReportKind::Output,
                                _ => ReportKind::Feature,
                            };
                            let entry = bits.entry((kind, globals.report_id)).or_insert(0);
                            *entry = entry
                                .saturating_add(globals.report_size.saturating_mul(globals.report_count));
                            if reports_use_id {
                                if let Some(item) = current_item {
                                    let id = u32::from(globals.report_id);
                                    if !item_report_ids[item].contains(&id) {
                                        item_report_ids[item].push(id);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                    // Locals never survive a main item.
                    locals = Locals::default();
                }
                _ => {}
            }
        }

        for (item, ids) in device_items.iter_mut().zip(item_report_ids) {
            if !ids.is_empty() {
                item.report_ids = Indexes::from_values(&ids);
            }
        }

        let max_len = |kind: ReportKind| -> usize {
            bits.iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, &b)| b.div_ceil(8) as usize)
                .max()
                .map_or(0, |payload| payload + 1)
        };

        Ok(ReportDescriptor {
            max_input: max_len(ReportKind::Input),
            max_output: max_len(ReportKind::Output),
            max_feature: max_len(ReportKind::Feature),
            device_items,
            reports_use_id,
        })
    }

    pub fn device_items(&self) -> &[DeviceItem] {
        &self.device_items
    }

    /// Maximum input report length in bytes, including the report-ID byte.
    /// 0 when the descriptor declares no input reports.
    pub fn max_input_report_length(&self) -> usize {
        self.max_input
    }

    pub fn max_output_report_length(&self) -> usize {
        self.max_output
    }

    pub fn max_feature_report_length(&self) -> usize {
        self.max_feature
    }

    /// Whether any report declares a report ID.
    pub fn reports_use_id(&self) -> bool {
        self.reports_use_id
    }

    /// First usage value of the first top-level item, or 0 if none exists.
    pub fn top_level_usage(&self) -> u32 {
        self.device_items
            .first()
            .and_then(|item| item.usages.all_values().next())
            .unwrap_or(0)
    }
}

fn extend_usage(page: u32, value: u32, size: usize) -> u32 {
    if size == 4 {
        value // four-byte usages carry their own page in the high word
    } else {
        (page << 16) | (value & 0xFFFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Standard three-button boot mouse.
    const MOUSE: &[u8] = &[
        0x05, 0x01, // Usage Page (Generic Desktop)
        0x09, 0x02, // Usage (Mouse)
        0xA1, 0x01, // Collection (Application)
        0x09, 0x01, //   Usage (Pointer)
        0xA1, 0x00, //   Collection (Physical)
        0x05, 0x09, //     Usage Page (Button)
        0x19, 0x01, //     Usage Minimum (1)
        0x29, 0x03, //     Usage Maximum (3)
        0x15, 0x00, //     Logical Minimum (0)
        0x25, 0x01, //     Logical Maximum (1)
        0x95, 0x03, //     Report Count (3)
        0x75, 0x01, //     Report Size (1)
        0x81, 0x02, //     Input (Data,Var,Abs)
        0x95, 0x01, //     Report Count (1)
        0x75, 0x05, //     Report Size (5)
        0x81, 0x03, //     Input (Const)
        0x05, 0x01, //     Usage Page (Generic Desktop)
        0x09, 0x30, //     Usage (X)
        0x09, 0x31, //     Usage (Y)
        0x15, 0x81, //     Logical Minimum (-127)
        0x25, 0x7F, //     Logical Maximum (127)
        0x75, 0x08, //     Report Size (8)
        0x95, 0x02, //     Report Count (2)
        0x81, 0x06, //     Input (Data,Var,Rel)
        0xC0, //           End Collection
        0xC0, //       End Collection
    ];

    #[test]
    fn mouse_descriptor_summary() {
        let desc = ReportDescriptor::parse(MOUSE).expect("parse");
        assert_eq!(desc.device_items().len(), 1);
        // 3 button bits + 5 padding + two 8-bit axes = 24 bits = 3 bytes,
        // plus the report-ID byte.
        assert_eq!(desc.max_input_report_length(), 4);
        assert_eq!(desc.max_output_report_length(), 0);
        assert_eq!(desc.max_feature_report_length(), 0);
        assert!(!desc.reports_use_id());
        assert_eq!(desc.top_level_usage(), 0x0001_0002); // Generic Desktop / Mouse
    }

    #[test]
    fn top_level_usage_defaults_to_zero() {
        let desc = ReportDescriptor::parse(&[]).expect("empty descriptor is fine");
        assert_eq!(desc.top_level_usage(), 0);
        assert_eq!(desc.device_items().len(), 0);
    }

    #[test]
    fn report_ids_and_per_id_lengths() {
        let bytes: &[u8] = &[
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x06, // Usage (Keyboard)
            0xA1, 0x01, // Collection (Application)
            0x85, 0x01, //   Report ID (1)
            0x75, 0x08, //   Report Size (8)
            0x95, 0x08, //   Report Count (8)
            0x81, 0x02, //   Input
            0x85, 0x02, //   Report ID (2)
            0x95, 0x02, //   Report Count (2)
            0x91, 0x02, //   Output
            0xC0, // End Collection
        ];
        let desc = ReportDescriptor::parse(bytes).expect("parse");
        assert!(desc.reports_use_id());
        assert_eq!(desc.max_input_report_length(), 9);
        assert_eq!(desc.max_output_report_length(), 3);
        let ids = desc.device_items()[0].report_ids();
        assert!(ids.contains_value(1));
        assert!(ids.contains_value(2));
        assert!(!ids.contains_value(3));
    }

    #[test]
    fn usage_range_becomes_capability_index() {
        let desc = ReportDescriptor::parse(MOUSE).expect("parse");
        let usages = desc.device_items()[0].usages();
        assert!(usages.contains_value(0x0001_0002));
        // Round-trip through the slot.
        let slot = usages.slot_of(0x0001_0002).expect("present");
        assert!(usages.values_of(slot).any(|v| v == 0x0001_0002));
    }

    #[test]
    fn unbalanced_end_collection_is_an_error() {
        let err = ReportDescriptor::parse(&[0xC0]).unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[test]
    fn truncated_trailing_item_is_ignored() {
        let mut bytes = MOUSE.to_vec();
        bytes.push(0x09); // one-byte-data item with the byte missing
        let desc = ReportDescriptor::parse(&bytes).expect("parse");
        assert_eq!(desc.max_input_report_length(), 4);
    }
}
