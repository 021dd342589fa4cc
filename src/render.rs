use indoc::formatdoc;

use crate::capture::{CaptureObject, HeapId};
use crate::classifier::filter::Filter;
use crate::classifier::NodeId;
use crate::errors::HeapSiftError;
use crate::heap_set::HeapSet;
use crate::source::TimeRange;
use crate::utils::pretty_signed_bytes_size;

/// One rendered line of a classification tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub depth: usize,
    pub label: String,
    pub allocations: i64,
    pub deallocations: i64,
    pub total: i64,
    pub shallow_size: i64,
    pub instances: i64,
    /// The label itself matched the active filter.
    pub matched: bool,
}

/// Walks the visible part of `heap_set` down to `max_depth` levels below the
/// root, largest sets first.
pub fn collect_rows(heap_set: &mut HeapSet, max_depth: usize) -> Vec<TreeRow> {
    let mut rows = Vec::new();
    let root = heap_set.root();
    push_rows(heap_set, root, 0, max_depth, &mut rows);
    rows
}

fn push_rows(heap_set: &mut HeapSet, node: NodeId, depth: usize, max_depth: usize, rows: &mut Vec<TreeRow>) {
    let set = heap_set.node(node);
    let stats = set.stats();
    rows.push(TreeRow {
        depth,
        label: set.label(),
        allocations: stats.delta_allocation_count,
        deallocations: stats.delta_deallocation_count,
        total: stats.total_object_count(),
        shallow_size: stats.total_shallow_size,
        instances: stats.instance_count,
        matched: set.is_matched(),
    });
    if depth >= max_depth {
        return;
    }
    let mut children = heap_set.children(node);
    children.sort_by_key(|child| {
        let stats = heap_set.node(*child).stats();
        (std::cmp::Reverse(stats.total_shallow_size), std::cmp::Reverse(stats.instance_count))
    });
    for child in children {
        push_rows(heap_set, child, depth + 1, max_depth, rows);
    }
}

pub fn render_table(analysis: &mut String, rows: &[TreeRow]) {
    if rows.is_empty() {
        return;
    }
    let rows_formatted: Vec<_> = rows
        .iter()
        .map(|row| {
            (
                row.allocations.to_string(),
                row.deallocations.to_string(),
                row.total.to_string(),
                pretty_signed_bytes_size(row.shallow_size),
                row.instances.to_string(),
                format!(
                    "{}{}{}",
                    "  ".repeat(row.depth),
                    row.label,
                    if row.matched { " *" } else { "" }
                ),
            )
        })
        .collect();

    let allocations_header = "Allocations";
    let allocations_padding = padding_for_header(&rows_formatted, |r| &r.0, allocations_header);
    let allocations_len = allocations_header.chars().count() + allocations_padding.chars().count();

    let deallocations_header = "Deallocations";
    let deallocations_padding = padding_for_header(&rows_formatted, |r| &r.1, deallocations_header);
    let deallocations_len = deallocations_header.chars().count() + deallocations_padding.chars().count();

    let total_header = "Total";
    let total_padding = padding_for_header(&rows_formatted, |r| &r.2, total_header);
    let total_len = total_header.chars().count() + total_padding.chars().count();

    let shallow_header = "Shallow size";
    let shallow_padding = padding_for_header(&rows_formatted, |r| &r.3, shallow_header);
    let shallow_len = shallow_header.chars().count() + shallow_padding.chars().count();

    let instances_header = "Instances";
    let instances_padding = padding_for_header(&rows_formatted, |r| &r.4, instances_header);
    let instances_len = instances_header.chars().count() + instances_padding.chars().count();

    let name_header = "Name";
    let name_padding = padding_for_header(&rows_formatted, |r| &r.5, name_header);

    let header = format!(
        "{}{} | {}{} | {}{} | {}{} | {}{} | {}{}\n",
        allocations_padding,
        allocations_header,
        deallocations_padding,
        deallocations_header,
        total_padding,
        total_header,
        shallow_padding,
        shallow_header,
        instances_padding,
        instances_header,
        name_header,
        name_padding
    );
    let header_len = header.chars().count();
    analysis.push_str(&header);
    analysis.push_str(&("-".repeat(header_len)));
    analysis.push('\n');

    for (allocations, deallocations, total, shallow, instances, name) in rows_formatted {
        let row = format!(
            "{}{} | {}{} | {}{} | {}{} | {}{} | {}\n",
            column_padding(&allocations, allocations_len),
            allocations,
            column_padding(&deallocations, deallocations_len),
            deallocations,
            column_padding(&total, total_len),
            total,
            column_padding(&shallow, shallow_len),
            shallow,
            column_padding(&instances, instances_len),
            instances,
            name
        );
        analysis.push_str(&row);
    }
}

fn padding_for_header<T, F>(rows: &[T], field_selector: F, header_label: &str) -> String
where
    F: Fn(&T) -> &String,
{
    let max_elem_size = rows
        .iter()
        .map(|d| field_selector(d).chars().count())
        .max()
        .unwrap_or_default();

    column_padding(header_label, max_elem_size)
}

fn column_padding(column_name: &str, max_item_length: usize) -> String {
    let column_label_len = column_name.chars().count();
    let padding_size = max_item_length.saturating_sub(column_label_len);
    " ".repeat(padding_size)
}

fn describe_filter(filter: Option<&Filter>) -> String {
    let Some(filter) = filter else {
        return "none".to_string();
    };
    let mut description = format!("`{}`", filter.text());
    if filter.is_regex() {
        description.push_str(", regex");
    }
    if filter.is_match_case() {
        description.push_str(", match case");
    }
    description
}

/// Summary plus one table per non empty heap, or only for `heap` when given.
/// Rows marked with `*` matched the filter.
pub fn render_capture<C: CaptureObject>(
    capture: &mut C,
    range: Option<TimeRange>,
    max_depth: usize,
    heap: Option<HeapId>,
) -> Result<String, HeapSiftError> {
    if let Some(heap_id) = heap {
        if capture.heap_set(heap_id).is_none() {
            return Err(HeapSiftError::UnknownHeap { heap_id });
        }
    }
    let mut analysis = formatdoc!(
        "\nCapture `{}` summary:\n
        Window: {}
        Instances: {}
        Heaps: {}\n",
        capture.name(),
        range.map_or_else(|| "snapshot".to_string(), |range| range.to_string()),
        capture.instances_count(),
        capture.heap_sets().len(),
    );
    for heap_set in capture.heap_sets_mut() {
        if heap_set.root_set().is_empty() || heap.is_some_and(|heap_id| heap_id != heap_set.heap_id()) {
            continue;
        }
        let grouping = heap_set.class_grouping();
        let filter = describe_filter(heap_set.filter());
        analysis.push_str(&format!(
            "\nHeap `{}` arranged by {} (filter: {}):\n\n",
            heap_set.name(),
            grouping,
            filter
        ));
        let rows = collect_rows(heap_set, max_depth);
        render_table(&mut analysis, &rows);
    }
    Ok(analysis)
}
