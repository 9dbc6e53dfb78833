
#![doc = r#"
# Sitewatch

Sitewatch watches the sources of a static site, rebuilds it with an external
generator one build at a time, and live-reloads connected browsers.

Change events can arrive much faster than a build finishes. They are funnelled
through a [`lock::CoalescingLock`]: the first event runs the build, and any
number of events arriving during that build collapse into exactly one follow-up
build.

## Modules

- [`builder`]: The rebuild operation and the external-command builder.
- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`event`]: Change events and reload messages.
- [`lock`]: The coalescing lock.
- [`rebuild`]: The change-triggered build loop.
- [`reload`]: Reload notification for connected browsers.
- [`watcher`]: File system watcher for change detection.
- [`web`]: Static site server and reload WebSocket.
"#]

pub mod builder;
pub mod config;
pub mod event;
pub mod lock;
pub mod rebuild;
pub mod reload;
pub mod watcher;
pub mod web;
