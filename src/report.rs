use indoc::formatdoc;

use crate::analysis::AnalysisStats;
use crate::heap::ObjectId;

const SIZE_UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Scales a byte count to the largest binary unit it fills: 80 -> "80 B",
/// 1536 -> "1.5 KiB".
pub fn format_bytes(len: u64) -> String {
    let mut value = len as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{len} B")
    } else {
        format!("{value:.1} {}", SIZE_UNITS[unit])
    }
}

// 1234567 -> "1,234,567"
pub fn format_count(count: u64) -> String {
    let digits = count.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

pub fn render_summary(stats: &AnalysisStats) -> String {
    formatdoc!(
        "\nAnalysis summary:\n
        Objects: {}
        Classes: {}
        GC roots: {}
        Multi-parent objects: {}
        Tree leaves: {}
        Deep-path objects: {}
        Reference blocks: {}",
        format_count(stats.object_count),
        format_count(stats.class_count as u64),
        format_count(stats.gc_root_count as u64),
        format_count(stats.multi_parent_count),
        format_count(stats.leaf_count),
        format_count(stats.deep_count),
        format_count(stats.reference_blocks as u64),
    )
}

// Render table from [(object_id, class_name, retained_size)]
pub fn render_top_retainers(rows: &[(ObjectId, String, u64)]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        out.push_str("\nNo retained objects found.\n");
        return out;
    }
    out.push_str(&format!("\nTop {} retainers:\n\n", rows.len()));

    let rows_formatted: Vec<_> = rows
        .iter()
        .map(|(object_id, class_name, retained)| {
            (
                format_bytes(*retained),
                format!("{object_id:#x}"),
                class_name,
            )
        })
        .collect();

    let retained_header = "Retained";
    let retained_len = column_width(
        rows_formatted.iter().map(|r| r.0.as_str()),
        retained_header,
    );
    let id_header = "Object id";
    let id_len = column_width(rows_formatted.iter().map(|r| r.1.as_str()), id_header);
    let class_name_header = "Class name";

    let header = format!(
        "{}{} | {}{} | {}\n",
        column_padding(retained_header, retained_len),
        retained_header,
        column_padding(id_header, id_len),
        id_header,
        class_name_header,
    );
    let header_len = header.chars().count();
    out.push_str(&header);
    out.push_str(&"-".repeat(header_len));
    out.push('\n');

    for (retained, object_id, class_name) in rows_formatted {
        out.push_str(&format!(
            "{}{} | {}{} | {}\n",
            column_padding(&retained, retained_len),
            retained,
            column_padding(&object_id, id_len),
            object_id,
            class_name,
        ));
    }
    out
}

fn column_width<'a>(items: impl Iterator<Item = &'a str>, header: &str) -> usize {
    items
        .map(|item| item.chars().count())
        .chain(std::iter::once(header.chars().count()))
        .max()
        .unwrap_or(0)
}

fn column_padding(value: &str, width: usize) -> String {
    let len = value.chars().count();
    " ".repeat(width.saturating_sub(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_scale_to_the_largest_fitting_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
        assert_eq!(format_bytes(5_905_580_032), "5.5 GiB");
    }

    #[test]
    fn counts_group_thousands() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
    }

    #[test]
    fn table_columns_line_up() {
        let rows = vec![
            (0x10u64, "com.example.Big".to_string(), 2_000_000u64),
            (0x2000u64, "com.example.Small".to_string(), 1_000u64),
        ];
        let table = render_top_retainers(&rows);
        let lines: Vec<&str> = table.lines().filter(|l| l.contains('|')).collect();
        assert_eq!(lines.len(), 3);
        let bar = lines[0].find('|').unwrap();
        assert!(lines.iter().all(|l| l.as_bytes()[bar] == b'|'));
        assert!(table.contains("com.example.Big"));
        assert!(table.contains("0x2000"));
    }

    #[test]
    fn empty_rows_render_a_notice() {
        assert!(render_top_retainers(&[]).contains("No retained objects"));
    }
}
