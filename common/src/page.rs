//! HTML served by both controller builds.

use crate::{
    config::{FeederConfig, SessionParameters},
    history::HistoryRow,
    schedule::render_schedule_text,
};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html><head>
<meta name="viewport" content="width=device-width,initial-scale=1">
<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/bulma@0.9.4/css/bulma.min.css">
<title>Duck Feeder</title>
<script>
function updateTime() {
  fetch('/getTime')
    .then(response => response.json())
    .then(data => {
      document.getElementById('liveTime').textContent = data.time;
      document.getElementById('amPm').textContent = data.amPm;
    })
    .catch(() => {});
  setTimeout(updateTime, 1000);
}
window.addEventListener('load', updateTime);
</script>
</head>
<body>
<section class="section">
 <div class="container">
  <h1 class="title">Duck Feeder</h1>
  <p class="subtitle is-6">Feeder time: <strong id="liveTime"></strong> <span id="amPm"></span></p>
  <div style="margin-top:20px;">
   <a href="/debug" class="button is-info is-small">View Feeding History</a>
  </div>
  <form method="post" action="/save">
   <div class="field"><label class="label">AM finish time (HH:MM)</label>
    <div class="control"><input class="input" type="time" name="A" value="%A%"></div></div>
   <div class="field"><label class="label">PM finish time (HH:MM)</label>
    <div class="control"><input class="input" type="time" name="P" value="%P%"></div></div>
   <div class="field"><label class="label">Total seconds per session (1-600)</label>
    <div class="control"><input class="input" type="number" name="Z" min="1" max="600" value="%Z%"></div></div>
   <div class="field"><label class="label">Number of feedings per session (2-50)</label>
    <div class="control"><input class="input" type="number" name="Y" min="2" max="50" value="%Y%"></div></div>
   <div class="field"><label class="label">Small-feed duration (1-30 s)</label>
    <div class="control"><input class="input" type="number" name="X" min="1" max="30" value="%X%"></div></div>
   <div class="field"><label class="label">Gap between feedings (1-60 min)</label>
    <div class="control"><input class="input" type="number" name="gap" min="1" max="60" value="%GAP%"></div></div>
   <button class="button is-primary">Save</button>
  </form>
  <hr>
  <h2 class="subtitle">Debug / Manual</h2>
  <form method="post" action="/manual">
   <div class="field"><label class="label">Manual run (%MANUAL_MIN%-%MANUAL_MAX% s)</label>
    <div class="control"><input class="input" type="number" name="dur" min="%MANUAL_MIN%" max="%MANUAL_MAX%" value="%MANUAL_DEFAULT%"></div></div>
   <button class="button is-warning">Feed Now</button>
  </form>
  <hr>
  <h2 class="subtitle">Current Schedule</h2>
  <pre>%SCHED%</pre>
 </div>
</section></body></html>
"#;

const HISTORY_HEAD: &str = "<!DOCTYPE html><html><head><title>Feeding Debug</title>\
<style>table {width:100%;} th {text-align:left;}</style></head><body>\
<h1>Last Feedings</h1><p><a href=\"/\">Back</a></p>\
<table><tr><th>Date</th><th>Time</th><th>Duration</th></tr>";

const HISTORY_TAIL: &str = "</table></body></html>";

pub fn render_index(params: &SessionParameters, config: &FeederConfig) -> String {
    INDEX_HTML
        .replace("%A%", &params.am_end.to_string())
        .replace("%P%", &params.pm_end.to_string())
        .replace("%Z%", &params.total_seconds.to_string())
        .replace("%Y%", &params.pulse_count.to_string())
        .replace("%X%", &params.short_pulse_seconds.to_string())
        .replace("%GAP%", &params.gap_minutes.to_string())
        .replace("%MANUAL_MIN%", &config.manual_min_seconds.to_string())
        .replace("%MANUAL_MAX%", &config.manual_max_seconds.to_string())
        .replace("%MANUAL_DEFAULT%", &config.manual_default_seconds.to_string())
        .replace("%SCHED%", &render_schedule_text(params))
}

pub fn render_history(rows: &[HistoryRow]) -> String {
    let mut html = String::from(HISTORY_HEAD);
    for row in rows {
        html.push_str("<tr><td>");
        html.push_str(&row.date);
        html.push_str("</td><td>");
        html.push_str(&row.time);
        html.push_str("</td><td>");
        html.push_str(&row.duration);
        html.push_str("</td></tr>");
    }
    html.push_str(HISTORY_TAIL);
    html
}
