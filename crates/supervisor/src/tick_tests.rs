// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const STREAK: u32 = 3;

fn up(n: usize) -> Vec<Vote> {
    vec![Vote::Up; n]
}

fn down(n: usize) -> Vec<Vote> {
    vec![Vote::Down; n]
}

#[test]
fn upscale_needs_a_full_streak() {
    let votes = up(2);
    let streaks = [0, 0];

    let mut up_ticks = 0;
    for tick in 1..STREAK {
        let (decision, next) = decide(&votes, &streaks, 2, 2, 4, STREAK, up_ticks);
        assert_eq!(decision, ScaleDecision::Hold, "tick {tick}");
        up_ticks = next;
        assert_eq!(up_ticks, tick);
    }
    let (decision, next) = decide(&votes, &streaks, 2, 2, 4, STREAK, up_ticks);
    assert_eq!(decision, ScaleDecision::Up);
    assert_eq!(next, 0, "streak resets after scaling");
}

#[test]
fn upscale_respects_cluster_max() {
    let votes = up(4);
    let streaks = [0; 4];
    let (decision, _) = decide(&votes, &streaks, 4, 2, 4, STREAK, STREAK);
    assert_eq!(decision, ScaleDecision::Hold);
}

#[test]
fn any_down_vote_resets_the_up_streak() {
    let votes = vec![Vote::Up, Vote::Up, Vote::Down];
    let streaks = [0, 0, 1];
    let (decision, next) = decide(&votes, &streaks, 3, 1, 4, STREAK, 2);
    assert_ne!(decision, ScaleDecision::Up);
    assert_eq!(next, 0);
}

#[test]
fn neutral_majority_holds() {
    let votes = vec![Vote::Up, Vote::Neutral, Vote::Neutral];
    let streaks = [0, 0, 0];
    let (decision, next) = decide(&votes, &streaks, 3, 1, 4, STREAK, 2);
    assert_eq!(decision, ScaleDecision::Hold);
    assert_eq!(next, 0, "no up majority, counter resets");
}

#[test]
fn downscale_picks_the_first_streaked_process() {
    let votes = down(3);
    let streaks = [1, STREAK, STREAK + 2];
    let (decision, _) = decide(&votes, &streaks, 3, 1, 4, STREAK, 0);
    assert_eq!(decision, ScaleDecision::Down(1));
}

#[test]
fn downscale_never_goes_below_min() {
    let votes = down(2);
    let streaks = [STREAK, STREAK];
    let (decision, _) = decide(&votes, &streaks, 2, 2, 4, STREAK, 0);
    assert_eq!(decision, ScaleDecision::Hold);
}

#[test]
fn downscale_waits_for_personal_streak() {
    let votes = down(2);
    let streaks = [1, 2];
    let (decision, _) = decide(&votes, &streaks, 2, 1, 4, STREAK, 0);
    assert_eq!(decision, ScaleDecision::Hold);
}

/// Spec property: constant up-pressure walks min -> max in
/// `streak` ticks per step; constant down-pressure walks back.
#[test]
fn autoscale_monotonicity() {
    let (min, max) = (2u32, 5u32);
    let mut total = min;
    let mut up_ticks = 0;
    let mut ticks_used = 0;
    while total < max {
        let votes = up(total as usize);
        let streaks = vec![0; total as usize];
        let (decision, next) = decide(&votes, &streaks, total, min, max, STREAK, up_ticks);
        up_ticks = next;
        ticks_used += 1;
        if decision == ScaleDecision::Up {
            total += 1;
        }
        assert!(ticks_used < 100, "failed to converge upward");
    }
    assert_eq!(total, max);
    assert_eq!(ticks_used, (max - min) * STREAK);

    // And back down: every process votes down with an elapsed streak.
    let mut ticks_down = 0;
    while total > min {
        let votes = down(total as usize);
        let streaks = vec![STREAK; total as usize];
        let (decision, _) = decide(&votes, &streaks, total, min, max, STREAK, 0);
        ticks_down += 1;
        match decision {
            ScaleDecision::Down(_) => total -= 1,
            other => panic!("expected downscale, got {other:?}"),
        }
        assert!(ticks_down < 100);
    }
    assert_eq!(total, min);
}

#[yare::parameterized(
    hot = { 90.0, Vote::Up },
    cold = { 10.0, Vote::Down },
    cruising = { 50.0, Vote::Neutral },
)]
fn vote_classification(cpu: f32, want: Vote) {
    let auto = pm3_manifest::AutoScaleSpec::default();
    assert_eq!(classify(cpu, &auto), want);
}
