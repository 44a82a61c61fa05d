/*
 * Test utilities and fixtures for Casterd
 *
 * This module provides recording hardware fakes, a scripted cycle
 * sensor and configuration builders shared by the unit tests.
 */
