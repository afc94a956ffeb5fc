//! FIR coefficient sets for the receive chain.

/// Receive low-pass for the 25 kHz AIS channel, applied while halving
/// 96 kHz down to 48 kHz.
pub static RECEIVER: [f32; 37] = [
    0.00119025, -0.00148464, -0.00282428, -0.00200561, -0.00068852, 0.00343044, 0.00902093,
    0.01367867, 0.01147965, 0.0027259, -0.01766614, -0.04244429, -0.0577468, -0.05245161,
    -0.01072754, 0.0732564, 0.17643278, 0.25582214, 0.28200453, 0.25582214, 0.17643278, 0.0732564,
    -0.01072754, -0.05245161, -0.0577468, -0.04244429, -0.01766614, 0.0027259, 0.01147965,
    0.01367867, 0.00902093, 0.00343044, -0.00068852, -0.00200561, -0.00282428, -0.00148464,
    0.00119025,
];

/// Matched filter against the GMSK pulse, applied while decimating from
/// 48 kHz to the 9600 Bd symbol rate.
pub static COHERENT: [f32; 17] = [
    2.06995719e-06,
    3.18610148e-05,
    3.40605309e-04,
    2.52892989e-03,
    1.30411453e-02,
    4.67076746e-02,
    1.16186141e-01,
    2.00730781e-01,
    2.40861391e-01,
    2.00730781e-01,
    1.16186141e-01,
    4.67076746e-02,
    1.30411453e-02,
    2.52892989e-03,
    3.40605309e-04,
    3.18610148e-05,
    2.06995719e-06,
];

// 28 1/3 Blackman Harris
pub static BLACKMAN_HARRIS_28_3: [f32; 26] = [
    6.32542387e-05,
    -2.90015252e-04,
    -1.54206250e-03,
    -1.64972455e-03,
    3.12793899e-03,
    1.09494413e-02,
    9.04975801e-03,
    -1.43685846e-02,
    -4.45615933e-02,
    -3.44883647e-02,
    5.53474269e-02,
    2.01827915e-01,
    3.16534610e-01,
    3.16534610e-01,
    2.01827915e-01,
    5.53474269e-02,
    -3.44883647e-02,
    -4.45615933e-02,
    -1.43685846e-02,
    9.04975801e-03,
    1.09494413e-02,
    3.12793899e-03,
    -1.64972455e-03,
    -1.54206250e-03,
    -2.90015252e-04,
    6.32542387e-05,
];

// 32 1/5 Blackman Harris
pub static BLACKMAN_HARRIS_32_5: [f32; 30] = [
    2.54561241e-05,
    2.98382002e-04,
    9.52682178e-04,
    1.60068516e-03,
    1.12710642e-03,
    -1.92265407e-03,
    -8.11999274e-03,
    -1.55260296e-02,
    -1.88381809e-02,
    -1.05762135e-02,
    1.54358355e-02,
    5.97213525e-02,
    1.14554365e-01,
    1.65320349e-01,
    1.95946857e-01,
    1.95946857e-01,
    1.65320349e-01,
    1.14554365e-01,
    5.97213525e-02,
    1.54358355e-02,
    -1.05762135e-02,
    -1.88381809e-02,
    -1.55260296e-02,
    -8.11999274e-03,
    -1.92265407e-03,
    1.12710642e-03,
    1.60068516e-03,
    9.52682178e-04,
    2.98382002e-04,
    2.54561241e-05,
];
