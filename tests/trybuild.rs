/// Compile-fail tests for the game type-state
///
/// Illegal transitions must not compile: playing a round before every team
/// is registered, playing after the game is complete, or reusing a game
/// value a transition already consumed.

#[test]
fn typestate_compile_fail_tests() {
    let t = trybuild::TestCases::new();

    // Rounds only exist on a started game
    t.compile_fail("tests/typestate_compile_fail/play_before_initialize.rs");
    t.compile_fail("tests/typestate_compile_fail/start_without_initialize.rs");

    // A completed game is final
    t.compile_fail("tests/typestate_compile_fail/play_after_completion.rs");

    // Transitions consume their input
    t.compile_fail("tests/typestate_compile_fail/reuse_consumed_game.rs");
}
