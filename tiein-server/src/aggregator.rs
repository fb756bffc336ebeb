use tiein_shared::OutputFrame;
use tokio::sync::mpsc;
use tracing::debug;

/// The caller's end of the output channel has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerGone;

/// When a round's content reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentRelease {
    /// Forward each delta as it arrives; content seen before the first tool
    /// fragment has already been sent.
    #[default]
    Immediate,
    /// Hold content until the round ends and release it only if the round
    /// made no tool calls. Tool-call rounds stay silent.
    AtRoundEnd,
}

impl ContentRelease {
    pub fn from_hold_flag(hold: bool) -> Self {
        if hold {
            ContentRelease::AtRoundEnd
        } else {
            ContentRelease::Immediate
        }
    }
}

/// Forwards content deltas to the caller in arrival order. Once a round
/// starts producing tool calls its remaining content is dropped.
pub struct ContentAggregator<'a> {
    tx: &'a mpsc::Sender<OutputFrame>,
    release: ContentRelease,
    held: Vec<String>,
    suppressed: bool,
    forwarded: usize,
    dropped: usize,
}

impl<'a> ContentAggregator<'a> {
    pub fn new(tx: &'a mpsc::Sender<OutputFrame>, release: ContentRelease) -> Self {
        Self {
            tx,
            release,
            held: Vec::new(),
            suppressed: false,
            forwarded: 0,
            dropped: 0,
        }
    }

    pub async fn forward(&mut self, text: String) -> Result<(), CallerGone> {
        if self.suppressed {
            self.dropped += text.len();
            return Ok(());
        }
        match self.release {
            ContentRelease::Immediate => self.send(text).await,
            ContentRelease::AtRoundEnd => {
                self.held.push(text);
                Ok(())
            }
        }
    }

    pub fn suppress(&mut self) {
        self.suppressed = true;
        self.dropped += self.held.drain(..).map(|text| text.len()).sum::<usize>();
    }

    /// Release held content of a round that made no tool calls.
    pub async fn finish(mut self) -> Result<(), CallerGone> {
        for text in std::mem::take(&mut self.held) {
            self.send(text).await?;
        }
        debug!(
            forwarded = self.forwarded,
            dropped = self.dropped,
            "Round content finished"
        );
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<(), CallerGone> {
        self.forwarded += text.len();
        self.tx
            .send(OutputFrame::Chunk(text))
            .await
            .map_err(|_| CallerGone)
    }
}
