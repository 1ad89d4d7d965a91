//! Terminal control panel
//!
//! Pure UI wiring around the core: renders the sensor control rows and a
//! status line, emits connect/disconnect and control-change requests, and
//! consumes status events on its own tick. Sensor state is never read back
//! from the core; the rows only mirror what the user last set.

use std::io::{self, stdout};
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use flume::{Receiver, Sender};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph},
    Terminal,
};

use crate::control::ControlCommand;
use crate::supervisor::{StatusEvent, UiRequest};

const FOCUS_RANGE: (u32, u32) = (0, 255);
const EXPOSURE_RANGE: (u32, u32) = (1, 33_000);
const ISO_RANGE: (u32, u32) = (100, 1_600);
const WB_RANGE: (u32, u32) = (1_000, 12_000);

/// Run the control panel until the user quits.
///
/// Sets up and restores the terminal around the draw loop; on exit a
/// Shutdown request is sent so the supervisor disconnects before the
/// process ends.
pub fn run(requests: Sender<UiRequest>, status: Receiver<StatusEvent>) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &requests, &status);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    let _ = requests.send(UiRequest::Shutdown);
    result
}

/// One selectable slider row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Row {
    Focus,
    Exposure,
    Iso,
    WhiteBalance,
}

const ROWS: [Row; 4] = [Row::Focus, Row::Exposure, Row::Iso, Row::WhiteBalance];

struct PanelState {
    selected: usize,
    focus: u32,
    exposure_us: u32,
    iso: u32,
    wb_kelvin: u32,
    auto_exposure: bool,
    connected: bool,
    status: String,
}

impl PanelState {
    fn new() -> Self {
        Self {
            selected: 0,
            focus: 128,
            exposure_us: 10_000,
            iso: 400,
            wb_kelvin: 6_500,
            auto_exposure: false,
            connected: false,
            status: "Disconnected".into(),
        }
    }

    fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::Status(text) => self.status = text,
            StatusEvent::DeviceConnected => self.connected = true,
            StatusEvent::DeviceDisconnected => self.connected = false,
        }
    }
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    requests: &Sender<UiRequest>,
    status: &Receiver<StatusEvent>,
) -> io::Result<()> {
    let mut state = PanelState::new();

    loop {
        // Status events arrive on our own tick, never mid-draw
        while let Ok(event) = status.try_recv() {
            state.apply(event);
        }

        terminal.draw(|frame| draw(frame, &state))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && !handle_key(key, &mut state, requests) {
                    return Ok(());
                }
            }
        }
    }
}

/// Returns false when the user asked to quit.
fn handle_key(key: KeyEvent, state: &mut PanelState, requests: &Sender<UiRequest>) -> bool {
    let coarse = key.modifiers.contains(KeyModifiers::SHIFT);
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return false,
        KeyCode::Char('c') => {
            let request = if state.connected {
                UiRequest::Disconnect
            } else {
                UiRequest::Connect
            };
            let _ = requests.send(request);
        }
        KeyCode::Up => state.selected = state.selected.saturating_sub(1),
        KeyCode::Down => state.selected = (state.selected + 1).min(ROWS.len() - 1),
        KeyCode::Left => adjust(state, requests, false, coarse),
        KeyCode::Right => adjust(state, requests, true, coarse),
        KeyCode::Char('a') => {
            if state.connected {
                let _ = requests.send(UiRequest::Control(ControlCommand::TriggerAutofocus));
            }
        }
        KeyCode::Char('e') => {
            if state.connected {
                state.auto_exposure = !state.auto_exposure;
                let _ = requests.send(UiRequest::Control(ControlCommand::SetAutoExposure(
                    state.auto_exposure,
                )));
            }
        }
        _ => {}
    }
    true
}

fn adjust(state: &mut PanelState, requests: &Sender<UiRequest>, up: bool, coarse: bool) {
    let row = ROWS[state.selected];
    let (value, range, step) = match row {
        Row::Focus => (&mut state.focus, FOCUS_RANGE, if coarse { 16 } else { 1 }),
        Row::Exposure => (
            &mut state.exposure_us,
            EXPOSURE_RANGE,
            if coarse { 2_500 } else { 250 },
        ),
        Row::Iso => (&mut state.iso, ISO_RANGE, if coarse { 200 } else { 50 }),
        Row::WhiteBalance => (
            &mut state.wb_kelvin,
            WB_RANGE,
            if coarse { 500 } else { 100 },
        ),
    };

    *value = if up {
        value.saturating_add(step).min(range.1)
    } else {
        value.saturating_sub(step).max(range.0)
    };

    if !state.connected {
        return;
    }

    let command = match row {
        Row::Focus => Some(ControlCommand::SetManualFocus(state.focus as u8)),
        // exposure time and ISO always travel together, and only while
        // the auto-exposure algorithm is off
        Row::Exposure | Row::Iso => (!state.auto_exposure).then_some(
            ControlCommand::SetManualExposure {
                time_us: state.exposure_us,
                iso: state.iso,
            },
        ),
        Row::WhiteBalance => Some(ControlCommand::SetWhiteBalance(state.wb_kelvin)),
    };
    if let Some(command) = command {
        let _ = requests.send(UiRequest::Control(command));
    }
}

fn draw(frame: &mut ratatui::Frame<'_>, state: &PanelState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // status
            Constraint::Length(3), // focus
            Constraint::Length(3), // exposure
            Constraint::Length(3), // iso
            Constraint::Length(3), // white balance
            Constraint::Length(2), // toggles
            Constraint::Min(1),    // help
        ])
        .split(frame.area());

    let status_style = if state.connected {
        Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
    };
    frame.render_widget(
        Paragraph::new(format!("Status: {}", state.status))
            .style(status_style)
            .block(Block::default().borders(Borders::ALL).title("oakcam")),
        chunks[0],
    );

    gauge_row(
        frame,
        chunks[1],
        state,
        Row::Focus,
        format!("Manual Focus: {}", state.focus),
        state.focus,
        FOCUS_RANGE,
    );
    gauge_row(
        frame,
        chunks[2],
        state,
        Row::Exposure,
        format!("Exposure: {} us", state.exposure_us),
        state.exposure_us,
        EXPOSURE_RANGE,
    );
    gauge_row(
        frame,
        chunks[3],
        state,
        Row::Iso,
        format!("ISO: {}", state.iso),
        state.iso,
        ISO_RANGE,
    );
    gauge_row(
        frame,
        chunks[4],
        state,
        Row::WhiteBalance,
        format!("Color Temperature: {} K", state.wb_kelvin),
        state.wb_kelvin,
        WB_RANGE,
    );

    let auto_exposure = if state.auto_exposure { "on" } else { "off" };
    frame.render_widget(
        Paragraph::new(format!("  Auto Exposure: {auto_exposure}")),
        chunks[5],
    );
    frame.render_widget(
        Paragraph::new(
            "  up/down select - left/right adjust (shift: coarse)\n  \
             a autofocus - e auto exposure - c connect/disconnect - q quit",
        )
        .style(Style::default().fg(Color::DarkGray)),
        chunks[6],
    );
}

fn gauge_row(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    state: &PanelState,
    row: Row,
    title: String,
    value: u32,
    range: (u32, u32),
) {
    let selected = ROWS[state.selected] == row;
    let color = if !state.connected {
        Color::DarkGray
    } else if selected {
        Color::Yellow
    } else {
        Color::Cyan
    };
    let border = if selected {
        Style::default().fg(Color::White)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let ratio = f64::from(value - range.0) / f64::from(range.1 - range.0);

    frame.render_widget(
        Gauge::default()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_style(border)
                    .title(title),
            )
            .gauge_style(Style::default().fg(color))
            .ratio(ratio.clamp(0.0, 1.0))
            .label(value.to_string()),
        area,
    );
}
