use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN/TURN urls handed to the peer connection
    pub ice_servers: Vec<String>,
    /// How many ICE candidates to pre-gather before they are needed
    pub ice_candidate_pool_size: u8,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun1.l.google.com:19302".into(),
                "stun:stun2.l.google.com:19302".into(),
            ],
            ice_candidate_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnTiming {
    /// How long a contestant stays unmuted after winning the button
    pub unmute_window: Duration,
    /// Granularity of the timer wheel. Deadlines are checked once per tick,
    /// so the effective precision of every other duration here is +/- one tick.
    pub tick: Duration,
    /// Pause between the unmute window closing and narration resuming
    pub resume_settle: Duration,
    /// Pause before restarting a recognizer that ended while capture is still wanted
    pub recognizer_restart: Duration,
    /// How long a final transcript stays on screen before captions clear
    pub caption_clear: Duration,
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self {
            unmute_window: Duration::from_secs(5),
            tick: Duration::from_millis(250),
            resume_settle: Duration::from_millis(500),
            recognizer_restart: Duration::from_secs(1),
            caption_clear: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Narration rate multiplier. 1.0 is the engine's natural pace.
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    pub lang: String,
    /// Voice names to try in order. Matched by substring against whatever
    /// the synthesizer reports, so partial names are fine.
    pub voice_preferences: Vec<String>,
    /// Estimated characters narrated per second at rate 1.0. Used to guess
    /// how far into an utterance the engine was when it got cut off.
    pub chars_per_second: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            rate: 0.9,
            pitch: 1.0,
            volume: 1.0,
            lang: "en-US".into(),
            voice_preferences: vec![
                "Microsoft Libby Online (Natural)".into(),
                "Microsoft Sarah Online (Natural)".into(),
                "Microsoft David Online (Natural)".into(),
                "Google UK English Female".into(),
                "Google UK English Male".into(),
                "Karen".into(),
                "Daniel".into(),
                "Samantha".into(),
                "Google US English".into(),
                "Microsoft Zira Online".into(),
            ],
            chars_per_second: 15.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionConfig {
    pub rtc: RtcConfig,
    pub timing: TurnTiming,
    pub speech: SpeechConfig,
}
