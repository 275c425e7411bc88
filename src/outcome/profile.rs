use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::core::TaskId;
use crate::engine::{NodeState, SkipReason};
use crate::graph::DependencyGraph;
use crate::outcome::{BuildResult, TaskExecution};

impl BuildResult {
    /// Renders the planned subgraph as a Mermaid diagram.
    ///
    /// * **Green to red**: executed, fast to slow
    /// * **Blue**: up-to-date
    /// * **Purple**: loaded from cache
    /// * **Dark red**: failed
    /// * **Grey**: skipped for any other reason
    pub fn render_mermaid(&self, graph: &DependencyGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let executed: Vec<f64> = self
            .succeeded
            .iter()
            .filter_map(|(id, _)| self.durations.get(id))
            .map(|t| t.duration.as_secs_f64())
            .collect();

        let min_time = executed.iter().copied().fold(f64::MAX, f64::min);
        let mut max_time = executed.iter().copied().fold(f64::MIN, f64::max);
        let min_time = if min_time > max_time { 0.0 } else { min_time };

        // All tasks took the same time.
        if (max_time - min_time).abs() < f64::EPSILON || max_time < min_time {
            max_time = min_time + 1.0;
        }

        let mut nodes: HashMap<&TaskId, usize> = HashMap::new();
        for (i, (id, state)) in self.states().iter().enumerate() {
            nodes.insert(id, i);
            let name = id.as_str().replace('"', "\\\"");

            let (label, color) = match state {
                NodeState::Succeeded => {
                    let duration = self.durations.get(id).map(|t| t.duration).unwrap_or_default();
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{duration:.2?}"), heat(t))
                }
                NodeState::Failed => ("Failed".to_string(), "#B22222".to_string()),
                NodeState::Skipped(SkipReason::UpToDate) => {
                    ("Up-to-date".to_string(), "#ADD8E6".to_string())
                }
                NodeState::Skipped(SkipReason::LoadedFromCache) => {
                    ("From cache".to_string(), "#D8BFD8".to_string())
                }
                NodeState::Skipped(reason) => (reason.name().to_string(), "#D3D3D3".to_string()),
                _ => (state.to_string(), "#FFFFFF".to_string()),
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        // Arrows point from a dependency to the task waiting on it.
        for (id, _) in self.states() {
            let Some(node) = graph.get(id.as_str()) else {
                continue;
            };
            let Some(&target) = nodes.get(id) else {
                continue;
            };
            for dependency in node.dependencies() {
                if let Some(&source) = nodes.get(dependency) {
                    let _ = writeln!(f, "    {source} --> {target}");
                }
            }
        }

        f
    }
}

/// 0.0 (green) -> 0.5 (yellow) -> 1.0 (red)
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        let r = (255.0 * t * 2.0) as u8;
        (r, 255, 0)
    } else {
        let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
        (255, g, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}

// WATERFALL

const ROW: u32 = 24;
const LABEL: u32 = 260;
const CHART: u32 = 720;
const MARGIN: u32 = 8;
const AXIS: u32 = 24;
const TICKS: u32 = 4;

const STYLE: &str = "text{font:12px sans-serif;fill:#222}\
.tick{stroke:#ddd}.tick-label{font-size:10px;fill:#888}\
.executed{fill:#4caf50}.failed{fill:#d32f2f}.up-to-date{fill:#90caf9}\
.from-cache{fill:#ce93d8}.other{fill:#bdbdbd}";

/// CSS class of a bar, by how the node ended.
fn bar_class(state: NodeState) -> &'static str {
    match state {
        NodeState::Succeeded => "executed",
        NodeState::Failed => "failed",
        NodeState::Skipped(SkipReason::UpToDate) => "up-to-date",
        NodeState::Skipped(SkipReason::LoadedFromCache) => "from-cache",
        _ => "other",
    }
}

fn escape(text: &str) -> Cow<'_, str> {
    if !text.contains(['<', '>', '&', '"', '\'']) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Maps instants of the run onto the horizontal axis of the chart.
struct Timeline {
    origin: Instant,
    span: Duration,
}

impl Timeline {
    fn new<'a>(executions: impl IntoIterator<Item = &'a TaskExecution>) -> Option<Self> {
        let mut bounds: Option<(Instant, Instant)> = None;
        for t in executions {
            let end = t.start + t.duration;
            bounds = Some(match bounds {
                Some((first, last)) => (first.min(t.start), last.max(end)),
                None => (t.start, end),
            });
        }

        let (origin, end) = bounds?;
        Some(Self {
            origin,
            span: end.duration_since(origin).max(Duration::from_micros(1)),
        })
    }

    fn scale(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() / self.span.as_secs_f64() * CHART as f64
    }

    fn x(&self, at: Instant) -> f64 {
        (LABEL + MARGIN) as f64 + self.scale(at.duration_since(self.origin))
    }
}

type Row<'a> = (&'a TaskId, NodeState, &'a TaskExecution);

impl BuildResult {
    /// Writes [`BuildResult::render_waterfall`] to `path`.
    pub fn render_waterfall_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), std::io::Error> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders an SVG timeline with one bar per dispatched node, coloured by
    /// its outcome. The bar spans the up-to-date check too, so skipped nodes
    /// show up as short bars.
    pub fn render_waterfall(&self) -> String {
        let mut rows: Vec<Row<'_>> = self
            .states()
            .iter()
            .filter_map(|(id, state)| self.durations.get(id).map(|t| (id, *state, t)))
            .collect();
        rows.sort_by_key(|(_, _, t)| t.start);

        let width = LABEL + CHART + 3 * MARGIN + 60;
        let height = AXIS + rows.len().max(1) as u32 * ROW + MARGIN;
        let mut svg = format!(
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>{STYLE}</style>"#
        );

        match Timeline::new(rows.iter().map(|(_, _, t)| *t)) {
            Some(timeline) => {
                write_axis(&mut svg, &timeline);
                for (i, row) in rows.iter().enumerate() {
                    write_row(&mut svg, &timeline, i, row);
                }
            }
            None => {
                let _ = write!(
                    svg,
                    r#"<text x="{MARGIN}" y="{}">No task was dispatched</text>"#,
                    AXIS + ROW / 2
                );
            }
        }

        svg.push_str("</svg>");
        svg
    }
}

fn write_axis(svg: &mut String, timeline: &Timeline) {
    for tick in 0..=TICKS {
        let at = timeline.span.mul_f64(f64::from(tick) / f64::from(TICKS));
        let x = timeline.x(timeline.origin + at);
        let _ = write!(
            svg,
            r#"<line class="tick" x1="{x:.1}" y1="{AXIS}" x2="{x:.1}" y2="100%"/><text class="tick-label" x="{x:.1}" y="{}" text-anchor="middle">{at:.1?}</text>"#,
            AXIS - 6
        );
    }
}

fn write_row(svg: &mut String, timeline: &Timeline, i: usize, &(id, state, exec): &Row<'_>) {
    let top = AXIS + i as u32 * ROW;
    let middle = top + ROW / 2;
    let name = escape(id.as_str());
    let x = timeline.x(exec.start);
    let w = timeline.scale(exec.duration).max(1.0);

    let _ = write!(
        svg,
        r#"<text x="{MARGIN}" y="{middle}" dominant-baseline="middle">{name}</text><rect class="{class}" x="{x:.1}" y="{bar_top}" width="{w:.1}" height="{bar_height}" rx="3"><title>{name} {state}: {dur:.2?}</title></rect><text class="tick-label" x="{after:.1}" y="{middle}" dominant-baseline="middle">{dur:.1?}</text>"#,
        class = bar_class(state),
        bar_top = top + 4,
        bar_height = ROW - 8,
        after = x + w + 4.0,
        dur = exec.duration,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::MustRunReason;
    use crate::core::BuildId;
    use crate::outcome::{NodeReport, RunSummary, Terminal, aggregate};
    use crate::task::TaskNode;

    fn result() -> (DependencyGraph, BuildResult) {
        let graph = DependencyGraph::from_nodes([
            TaskNode::new(":gen").lifecycle(),
            TaskNode::new(":a<b>").depends_on(":gen").lifecycle(),
            TaskNode::new(":docs").depends_on(":gen").lifecycle(),
        ])
        .unwrap();

        let start = Instant::now();
        let exec = |offset: u64, ms: u64| TaskExecution {
            start: start + Duration::from_millis(offset),
            duration: Duration::from_millis(ms),
        };

        let reports = vec![
            NodeReport {
                id: TaskId::new(":gen"),
                terminal: Terminal::Succeeded(MustRunReason::NoHistory),
                execution: Some(exec(0, 10)),
            },
            NodeReport {
                id: TaskId::new(":a<b>"),
                terminal: Terminal::Succeeded(MustRunReason::NoHistory),
                execution: Some(exec(10, 30)),
            },
            NodeReport {
                id: TaskId::new(":docs"),
                terminal: Terminal::Skipped(SkipReason::UpToDate),
                execution: Some(exec(10, 1)),
            },
        ];

        let summary = RunSummary {
            build_id: BuildId::new(),
            dispatch_order: Vec::new(),
            cancelled: false,
            elapsed: Duration::from_millis(40),
            store_error: None,
        };

        (graph, aggregate(reports, summary))
    }

    #[test]
    fn test_mermaid() {
        let (graph, result) = result();
        let chart = result.render_mermaid(&graph);

        assert!(chart.starts_with("graph LR\n"));
        assert!(chart.contains("style 0 fill:#00FF00"));
        assert!(chart.contains("style 1 fill:#FF0000"));
        assert!(chart.contains("Up-to-date"));
        assert!(chart.contains("    0 --> 1\n"));
        assert!(chart.contains("    0 --> 2\n"));
    }

    #[test]
    fn test_waterfall_colours_by_outcome() {
        let (_, result) = result();
        let svg = result.render_waterfall();

        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(":a&lt;b&gt;"));
        assert_eq!(svg.matches(r#"class="executed""#).count(), 2);
        assert_eq!(svg.matches(r#"class="up-to-date""#).count(), 1);
        assert!(!svg.contains("No task was dispatched"));
    }

    #[test]
    fn test_waterfall_without_dispatched_tasks() {
        let (_, mut result) = result();
        result.durations.clear();

        let svg = result.render_waterfall();
        assert!(svg.contains("No task was dispatched"));
        assert!(!svg.contains("<rect"));
    }

    #[test]
    fn test_escape() {
        assert!(matches!(escape(":plain"), Cow::Borrowed(":plain")));
        assert_eq!(escape(r#"a<"b">&'c'"#), "a&lt;&quot;b&quot;&gt;&amp;&apos;c&apos;");
    }
}
