//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use common::{CHUNK, SAMPLE_RATE, loud_frame, silent_frame, test_config};
use dia_assistant::config::{AsrConfig, TtsConfig};
use dia_assistant::voice::{
    AudioFrame, Completion, CommandSynthesizer, CommandTranscriber, EnergyKeywordModel,
    FrameAssembler, FrameQueue, PcmAudio, Synthesizer, Transcriber, Utterance, UtteranceRecorder,
    WakeDetector, WakeSignal, load_error_clip, tone,
};

fn detector(sensitivity: f32) -> (WakeDetector, watch::Sender<f32>) {
    let config = test_config();
    let (tx, rx) = watch::channel(sensitivity);
    let detector = WakeDetector::new(
        Box::new(EnergyKeywordModel::new(config.wake_word.energy_floor)),
        &config.wake_word,
        SAMPLE_RATE,
        rx,
    );
    (detector, tx)
}

#[test]
fn test_queue_drops_oldest_under_backpressure() {
    let queue = FrameQueue::new(10);

    let started = Instant::now();
    for i in 0..1000_i16 {
        queue.push(AudioFrame::new(vec![i; 4]));
    }
    // Producer never waits on a stalled consumer
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(queue.len(), 10);
    assert_eq!(queue.dropped(), 990);
    assert_eq!(queue.pushed(), 1000);

    // Survivors are the newest frames, oldest first
    let first = queue.try_pop().unwrap();
    assert_eq!(first.samples()[0], 990);
}

#[test]
fn test_drop_count_only_grows() {
    let queue = FrameQueue::new(2);
    let mut last = 0;
    for _ in 0..20 {
        queue.push(silent_frame());
        let dropped = queue.dropped();
        assert!(dropped >= last);
        last = dropped;
        if dropped % 3 == 0 {
            let _ = queue.try_pop();
        }
    }
    assert!(last > 0);
}

#[tokio::test]
async fn test_queue_delivers_in_capture_order() {
    let queue = FrameQueue::new(8);
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = queue.recv().await {
                seen.push(frame.samples()[0]);
            }
            seen
        })
    };

    for i in 0..5_i16 {
        queue.push(AudioFrame::new(vec![i; 2]));
        tokio::task::yield_now().await;
    }
    queue.close();

    let seen = consumer.await.unwrap();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_closed_queue_drains_before_ending() {
    let queue = FrameQueue::new(4);
    queue.push(silent_frame());
    queue.close();

    assert!(tokio_test::block_on(queue.recv()).is_some());
    assert!(tokio_test::block_on(queue.recv()).is_none());
}

#[test]
fn test_silence_never_wakes() {
    let (mut detector, _tx) = detector(0.5);
    for _ in 0..100 {
        assert_eq!(detector.observe(&silent_frame()), WakeSignal::None);
    }
}

#[test]
fn test_voiced_window_wakes_once_window_fills() {
    let (mut detector, _tx) = detector(0.5);
    assert_eq!(detector.observe(&loud_frame()), WakeSignal::None);
    assert!(matches!(detector.observe(&loud_frame()), WakeSignal::Detected(c) if c > 0.99));
}

#[test]
fn test_sensitivity_change_applies_to_next_frame() {
    let (mut detector, tx) = detector(0.9);

    // Half-voiced windows score 0.5
    for _ in 0..5 {
        assert_eq!(detector.observe(&loud_frame()), WakeSignal::None);
        assert_eq!(detector.observe(&silent_frame()), WakeSignal::None);
    }

    tx.send_replace(0.5);
    assert!((detector.sensitivity() - 0.5).abs() < f32::EPSILON);
    assert!(matches!(detector.observe(&loud_frame()), WakeSignal::Detected(_)));
}

#[test]
fn test_recorder_end_to_end() {
    let recorder = UtteranceRecorder::from_config(&test_config());
    let mut buffer = recorder.start();

    for _ in 0..8 {
        recorder.push(&mut buffer, loud_frame()).unwrap();
    }
    assert!(!recorder.is_complete(&buffer));
    for _ in 0..10 {
        recorder.push(&mut buffer, silent_frame()).unwrap();
    }
    assert_eq!(recorder.completion(&buffer), Some(Completion::Silence));

    let utterance = recorder.finalize(buffer);
    assert_eq!(utterance.samples().len(), 8 * CHUNK);
    assert_eq!(utterance.duration(), Duration::from_millis(800));
}

#[test]
fn test_frame_assembler_rechunks_and_downmixes() {
    let mut assembler = FrameAssembler::new(4, 2);
    let mut frames = Vec::new();

    // Stereo pairs, left and right equal
    let interleaved: Vec<i16> = (0..10).flat_map(|i| [i * 100, i * 100]).collect();
    assembler.push_i16(&interleaved, |frame| frames.push(frame));

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].samples(), &[0, 100, 200, 300]);
    assert_eq!(assembler.pending(), 2);
}

#[test]
fn test_wav_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    let clip = PcmAudio::new(tone(440.0, 0.1, 0.4, SAMPLE_RATE), SAMPLE_RATE);

    clip.write_wav(&path).unwrap();
    let loaded = load_error_clip(Some(&path), SAMPLE_RATE);
    assert_eq!(loaded, clip);
}

#[test]
fn test_unreadable_error_clip_falls_back_to_beep() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.wav");
    let clip = load_error_clip(Some(&path), SAMPLE_RATE);
    assert!(!clip.is_empty());
    assert_eq!(clip.sample_rate, SAMPLE_RATE);
}

fn asr(command: &str, args: &[&str]) -> AsrConfig {
    AsrConfig {
        model_path: None,
        sample_rate: SAMPLE_RATE,
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
    }
}

fn tts(command: &str, args: &[&str]) -> TtsConfig {
    TtsConfig {
        model_path: None,
        sample_rate: SAMPLE_RATE,
        command: command.to_string(),
        args: args.iter().map(ToString::to_string).collect(),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_transcriber_reads_stdout() {
    let transcriber = CommandTranscriber::new(&asr(
        "sh",
        &["-c", "test -s \"$0\" && echo '[BLANK_AUDIO]  what time  is it'", "{input}"],
    ));
    let utterance = Utterance::from_samples(vec![1_000; CHUNK], SAMPLE_RATE);

    let text = transcriber.transcribe(utterance).await.unwrap();
    assert_eq!(text, "what time is it");
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_transcriber_reports_engine_failure() {
    let transcriber = CommandTranscriber::new(&asr("sh", &["-c", "exit 3"]));
    let utterance = Utterance::from_samples(vec![1_000; CHUNK], SAMPLE_RATE);
    assert!(transcriber.transcribe(utterance).await.is_err());
}

#[tokio::test]
async fn test_empty_utterance_transcribes_to_nothing() {
    let transcriber = CommandTranscriber::new(&asr("dia-no-such-asr", &[]));
    let utterance = Utterance::from_samples(Vec::new(), SAMPLE_RATE);
    assert_eq!(transcriber.transcribe(utterance).await.unwrap(), "");
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_synthesizer_reads_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("voice.wav");
    let clip = PcmAudio::new(tone(220.0, 0.2, 0.3, SAMPLE_RATE), SAMPLE_RATE);
    clip.write_wav(&source).unwrap();

    let script = format!("cp '{}' \"$0\"", source.display());
    let synthesizer = CommandSynthesizer::new(&tts("sh", &["-c", &script, "{output}"]));

    let audio = synthesizer.synthesize("Hello there.".to_string()).await.unwrap();
    assert_eq!(audio, clip);
}
