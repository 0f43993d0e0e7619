use crate::keybindings::{KeyCategory, get_all_keybindings, get_status_bar_keybindings};
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
};
use xnettop::stats::ProcessStats;

const NAME_WIDTH: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Download,
    Upload,
    Total,
    Name,
}

impl SortColumn {
    fn label(&self) -> &'static str {
        match self {
            SortColumn::Download => "download",
            SortColumn::Upload => "upload",
            SortColumn::Total => "total",
            SortColumn::Name => "name",
        }
    }
}

/// Sum over every displayed row
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub upload_rate: f64,
    pub download_rate: f64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

pub struct AppState {
    pub process_list: Vec<ProcessStats>,
    pub selected_index: Option<usize>,
    pub list_state: ListState,
    pub show_help: bool,
    pub status_message: String,
    pub sort_column: SortColumn,
    /// Descending when true
    pub sort_reverse: bool,
    pub totals: Totals,
    pub interface: String,
}

impl AppState {
    pub fn new(interface: Option<&str>) -> Self {
        Self {
            process_list: Vec::new(),
            selected_index: None,
            list_state: ListState::default(),
            show_help: false,
            status_message: String::from("xnettop started. Press 'h' for help."),
            sort_column: SortColumn::Total,
            sort_reverse: true,
            totals: Totals::default(),
            interface: interface.unwrap_or("all interfaces").to_string(),
        }
    }

    /// Replace the displayed rows with a fresh snapshot.
    ///
    /// Processes that never moved a byte are hidden. The selection follows
    /// its PID across re-sorts.
    pub fn update_processes(&mut self, snapshot: Vec<ProcessStats>) {
        let selected_pid = self.get_selected_process().map(|p| p.pid);

        self.process_list = snapshot
            .into_iter()
            .filter(|s| s.upload_rate >= 1.0 || s.download_rate >= 1.0 || s.total_bytes() > 0)
            .collect();
        self.sort_processes();

        self.totals = self
            .process_list
            .iter()
            .fold(Totals::default(), |mut totals, s| {
                totals.upload_rate += s.upload_rate;
                totals.download_rate += s.download_rate;
                totals.upload_bytes += s.upload_bytes;
                totals.download_bytes += s.download_bytes;
                totals
            });

        let index = selected_pid
            .and_then(|pid| self.process_list.iter().position(|p| p.pid == pid))
            .or_else(|| {
                // Selected process disappeared: clamp instead of jumping to the top
                self.selected_index
                    .filter(|_| !self.process_list.is_empty())
                    .map(|idx| idx.min(self.process_list.len() - 1))
            });
        self.set_selection(index);
    }

    /// Select a sort column; choosing the current column again flips the order
    pub fn sort_by(&mut self, column: SortColumn) {
        if self.sort_column == column {
            self.sort_reverse = !self.sort_reverse;
        } else {
            self.sort_column = column;
            // Names read naturally A-Z, rates busiest first
            self.sort_reverse = column != SortColumn::Name;
        }

        let selected_pid = self.get_selected_process().map(|p| p.pid);
        self.sort_processes();
        let index =
            selected_pid.and_then(|pid| self.process_list.iter().position(|p| p.pid == pid));
        self.set_selection(index);

        self.status_message = format!(
            "Sorted by {} ({})",
            self.sort_column.label(),
            if self.sort_reverse {
                "descending"
            } else {
                "ascending"
            }
        );
    }

    fn sort_processes(&mut self) {
        let column = self.sort_column;
        self.process_list.sort_by(|a, b| {
            let ordering = match column {
                SortColumn::Download => a.download_rate.total_cmp(&b.download_rate),
                SortColumn::Upload => a.upload_rate.total_cmp(&b.upload_rate),
                SortColumn::Total => a.total_rate().total_cmp(&b.total_rate()),
                SortColumn::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            };
            ordering.then_with(|| a.pid.cmp(&b.pid))
        });
        if self.sort_reverse {
            self.process_list.reverse();
        }
    }

    fn set_selection(&mut self, index: Option<usize>) {
        self.selected_index = index;
        self.list_state.select(index);
    }

    pub fn select_next(&mut self) {
        if self.process_list.is_empty() {
            return;
        }

        let new_index = match self.selected_index {
            None => 0,
            Some(idx) => (idx + 1) % self.process_list.len(),
        };
        self.set_selection(Some(new_index));
    }

    pub fn select_previous(&mut self) {
        if self.process_list.is_empty() {
            return;
        }

        let new_index = match self.selected_index {
            None => 0,
            Some(0) => self.process_list.len() - 1,
            Some(idx) => idx - 1,
        };
        self.set_selection(Some(new_index));
    }

    pub fn get_selected_process(&self) -> Option<&ProcessStats> {
        self.selected_index
            .and_then(|idx| self.process_list.get(idx))
    }
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() > width {
        let head: String = name.chars().take(width - 3).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

pub fn draw_ui(f: &mut Frame, app: &mut AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // Header + totals
            Constraint::Min(10),   // Process list
            Constraint::Length(3), // Status bar
        ])
        .split(f.area());

    draw_header(f, chunks[0], app);
    draw_process_list(f, chunks[1], app);
    draw_status_bar(f, chunks[2], app);

    if app.show_help {
        draw_help_overlay(f, f.area());
    }
}

fn draw_header(f: &mut Frame, area: Rect, app: &AppState) {
    let totals = &app.totals;
    let lines = vec![
        Line::from(Span::styled(
            format!(
                "xnettop v{} - Per-process network traffic on {}",
                env!("CARGO_PKG_VERSION"),
                app.interface
            ),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::raw("Total: "),
            Span::styled(
                ProcessStats::format_rate(totals.upload_rate + totals.download_rate),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw("  |  Up: "),
            Span::styled(
                format!(
                    "{} ({})",
                    ProcessStats::format_rate(totals.upload_rate),
                    ProcessStats::format_bytes(totals.upload_bytes)
                ),
                Style::default().fg(Color::Yellow),
            ),
            Span::raw("  |  Down: "),
            Span::styled(
                format!(
                    "{} ({})",
                    ProcessStats::format_rate(totals.download_rate),
                    ProcessStats::format_bytes(totals.download_bytes)
                ),
                Style::default().fg(Color::Green),
            ),
        ]),
    ];

    let header = Paragraph::new(lines).block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn draw_process_list(f: &mut Frame, area: Rect, app: &mut AppState) {
    let items: Vec<ListItem> = app
        .process_list
        .iter()
        .enumerate()
        .map(|(index, proc)| {
            let selection_indicator = if Some(index) == app.list_state.selected() {
                "▶ "
            } else {
                "  "
            };
            let pid = if proc.is_unknown() {
                "?".to_string()
            } else {
                proc.pid.to_string()
            };
            let name_style = if proc.is_unknown() {
                Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::ITALIC)
            } else {
                Style::default().fg(Color::White)
            };

            let content = Line::from(vec![
                Span::styled(selection_indicator, Style::default().fg(Color::Yellow)),
                Span::styled(
                    format!("{:width$} ", truncate(&proc.name, NAME_WIDTH), width = NAME_WIDTH),
                    name_style,
                ),
                Span::raw(format!("{:>7} ", pid)),
                Span::styled(
                    format!("↓{:>11} ", ProcessStats::format_rate(proc.download_rate)),
                    Style::default().fg(Color::Green),
                ),
                Span::styled(
                    format!("↑{:>11} ", ProcessStats::format_rate(proc.upload_rate)),
                    Style::default().fg(Color::Yellow),
                ),
                Span::styled(
                    format!("{:>11} ", ProcessStats::format_rate(proc.total_rate())),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!("{:>10} ", ProcessStats::format_bytes(proc.download_bytes)),
                    Style::default().fg(Color::Cyan),
                ),
                Span::styled(
                    format!("{:>10}", ProcessStats::format_bytes(proc.upload_bytes)),
                    Style::default().fg(Color::Magenta),
                ),
            ]);

            ListItem::new(content)
        })
        .collect();

    let bold = Style::default().add_modifier(Modifier::BOLD);
    let header = Line::from(vec![
        Span::styled(
            format!("{:width$} ", "Process", width = NAME_WIDTH),
            bold,
        ),
        Span::styled("    PID ", bold),
        Span::styled("   Download  ", bold),
        Span::styled("     Upload  ", bold),
        Span::styled("      Total ", bold),
        Span::styled("Total Down ", bold),
        Span::styled("  Total Up", bold),
    ]);

    // Header takes the first row inside the border, the list gets the rest
    let header_area = Rect {
        x: area.x + 3, // +1 for border, +2 for selection indicator
        y: area.y + 1,
        width: area.width.saturating_sub(4),
        height: 1,
    };

    let inner_list_area = Rect {
        x: area.x + 1,
        y: area.y + 2,
        width: area.width.saturating_sub(2),
        height: area.height.saturating_sub(3),
    };

    let border = Block::default().borders(Borders::ALL).title(format!(
        "Processes ({}) - sorted by {}",
        app.process_list.len(),
        app.sort_column.label()
    ));
    f.render_widget(border, area);
    f.render_widget(Paragraph::new(header), header_area);

    let list = List::new(items).highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );
    f.render_stateful_widget(list, inner_list_area, &mut app.list_state);
}

fn draw_status_bar(f: &mut Frame, area: Rect, app: &AppState) {
    let mut spans = vec![];

    for (i, (key, description)) in get_status_bar_keybindings().iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw("  "));
        }
        spans.push(Span::styled(
            format!("[{}]", key),
            Style::default().fg(Color::Yellow),
        ));
        spans.push(Span::raw(format!(" {}", description)));
    }

    spans.push(Span::raw("  |  "));
    spans.push(Span::styled(
        &app.status_message,
        Style::default().fg(Color::Gray),
    ));

    let status =
        Paragraph::new(vec![Line::from(spans)]).block(Block::default().borders(Borders::ALL));
    f.render_widget(status, area);
}

fn draw_help_overlay(f: &mut Frame, area: Rect) {
    let mut help_text = vec![
        Line::from(""),
        Line::from(Span::styled(
            "xnettop - Keyboard Shortcuts",
            Style::default().add_modifier(Modifier::BOLD),
        )),
    ];

    let bindings = get_all_keybindings();
    for category in [
        KeyCategory::Navigation,
        KeyCategory::Sorting,
        KeyCategory::System,
    ] {
        help_text.push(Line::from(""));
        help_text.push(Line::from(Span::styled(
            category.title(),
            Style::default().fg(Color::Yellow),
        )));
        for binding in bindings.iter().filter(|b| b.category == category) {
            help_text.push(Line::from(format!(
                "  {:14} - {}",
                binding.key, binding.description
            )));
        }
    }

    help_text.push(Line::from(""));
    help_text.push(Line::from("Press any key to close..."));

    let help = Paragraph::new(help_text)
        .style(Style::default().bg(Color::Black).fg(Color::White))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Help")
                .style(Style::default().fg(Color::Cyan)),
        );

    let help_area = centered_rect(60, 60, area);
    f.render_widget(Clear, help_area);
    f.render_widget(help, help_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
